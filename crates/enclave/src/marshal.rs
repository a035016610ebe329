//! Recursive conversion of values crossing the sandbox boundary.
//!
//! `export` prepares a host value for transmission: composites are walked,
//! error-shaped values become proxy records, and callables are replaced by
//! freshly minted function pointers registered in the [`CallableRegistry`].
//! `hydrate` is the inverse along the opposite direction: proxy records
//! become [`Fault`]s and callable handles that tunnel `callFunctionPointer`
//! requests back through the driver's correlation machinery.

use std::{collections::HashMap, sync::Arc};

use enclave_wire::{ErrorRecord, FunctionPointer, WireValue};
use tokio::sync::{mpsc, oneshot};

use crate::{
    driver::{CallRequest, Command, SendMode},
    error::Error,
    value::{BoxError, Callable, Fault, Value},
};

/// Host callables the sandbox may invoke, keyed by the pointer token handed
/// to it. Entries are only ever added between resets; the sandbox may retain
/// a pointer and call it at any later time, so individual removal would turn
/// valid handles into dangling ones.
pub(crate) struct CallableRegistry {
    entries: HashMap<FunctionPointer, Arc<dyn Callable>>,
    next_index: u64,
}

impl CallableRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_index: 0,
        }
    }

    /// Mint a fresh pointer for a callable. Every export gets its own token;
    /// the index stays monotonic across resets so tokens are unique for the
    /// lifetime of the owning processor.
    pub(crate) fn register(&mut self, callable: Arc<dyn Callable>) -> FunctionPointer {
        let pointer = FunctionPointer::new(self.next_index, callable.arity());
        self.next_index += 1;
        self.entries.insert(pointer.clone(), callable);
        pointer
    }

    pub(crate) fn get(&self, pointer: &FunctionPointer) -> Option<Arc<dyn Callable>> {
        self.entries.get(pointer).cloned()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Prepare a host value to be handed to the sandbox.
pub(crate) fn export(value: Value, registry: &mut CallableRegistry) -> WireValue {
    match value {
        Value::Null => WireValue::Null,
        Value::Bool(value) => WireValue::Bool(value),
        Value::Int(value) => WireValue::Int(value),
        Value::Float(value) => WireValue::Float(value),
        Value::Text(value) => WireValue::Text(value),
        Value::Bytes(value) => WireValue::Bytes(value),
        Value::List(items) => WireValue::List(
            items
                .into_iter()
                .map(|item| export(item, registry))
                .collect(),
        ),
        Value::Map(entries) => WireValue::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key, export(value, registry)))
                .collect(),
        ),
        Value::Fault(fault) => WireValue::Error(ErrorRecord::new(fault.name, fault.message)),
        Value::Function(callable) => WireValue::Function(registry.register(callable)),
    }
}

/// Reconstruct a wire value arriving from the sandbox.
pub(crate) fn hydrate(value: WireValue, caller: &RemoteCaller) -> Value {
    match value {
        WireValue::Null => Value::Null,
        WireValue::Bool(value) => Value::Bool(value),
        WireValue::Int(value) => Value::Int(value),
        WireValue::Float(value) => Value::Float(value),
        WireValue::Text(value) => Value::Text(value),
        WireValue::Bytes(value) => Value::Bytes(value),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| hydrate(item, caller))
                .collect(),
        ),
        WireValue::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key, hydrate(value, caller)))
                .collect(),
        ),
        WireValue::Error(record) => Value::Fault(Fault::new(record.name, record.message)),
        WireValue::Function(pointer) => Value::Function(Arc::new(RemoteFunction {
            pointer,
            caller: caller.clone(),
        })),
    }
}

/// Handle for issuing correlated requests back into the driver, cloned into
/// every hydrated function so reverse calls reuse the ordinary dispatch path.
#[derive(Clone)]
pub(crate) struct RemoteCaller {
    commands: mpsc::UnboundedSender<Command>,
}

impl RemoteCaller {
    pub(crate) const fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    async fn call_pointer(
        &self,
        pointer: FunctionPointer,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Call {
                mode: SendMode::Established,
                request: CallRequest::CallFunctionPointer { pointer, args },
                reply,
            })
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }
}

/// A sandbox-side callable reachable through its exported pointer.
struct RemoteFunction {
    pointer: FunctionPointer,
    caller: RemoteCaller,
}

#[async_trait::async_trait]
impl Callable for RemoteFunction {
    fn arity(&self) -> usize {
        self.pointer.arity().unwrap_or(0)
    }

    async fn call(&self, args: Vec<Value>) -> core::result::Result<Value, BoxError> {
        let value = self
            .caller
            .call_pointer(self.pointer.clone(), args)
            .await
            .map_err(|error| -> BoxError { Box::new(error) })?;
        Ok(value)
    }
}
