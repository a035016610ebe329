//! The processor's driver: a single task owning the sandbox lifecycle.
//!
//! Every input — a command from the host-facing handle or an envelope from
//! the sandbox — is processed to completion before the next one, so state
//! transitions, correlation-table updates and queue mutations are strictly
//! sequential and need no locking. The externally visible surface
//! ([`crate::Processor`]) only ever talks to the driver through its command
//! channel.

use std::{
    collections::{HashMap, VecDeque},
    ops::ControlFlow,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use enclave_wire::{Envelope, ErrorRecord, FunctionPointer, Request, RequestId, WireValue};
use futures::FutureExt;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    TRACE_TARGET,
    error::{Error, ResetReason, Result},
    marshal::{self, CallableRegistry, RemoteCaller},
    processor::{InitHook, InitScope, ResetHook},
    transport::{InboundItem, Transport},
    value::{BoxError, Value},
};

/// Sandbox messages buffered ahead of the driver; bounds what an untrusted
/// runtime can force the host to hold.
const INBOUND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    /// No isolated context exists.
    Initial,
    /// The context is spawning; the ready notification has not arrived.
    Loading,
    /// The runtime is up and the initialize hook is running.
    Initializing,
    /// Generally available; queued calls have been flushed.
    Running,
}

/// Which lifecycle states a request may be dispatched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendMode {
    /// Requires `Running`; queued until the sandbox gets there.
    Ready,
    /// Requires `Initializing`; anything else is a caller bug and fails fast.
    Bootstrap,
    /// Requires `Initializing` or `Running`: used for function pointers,
    /// which can only exist once the sandbox is at least partially up.
    Established,
}

/// A call as issued by the host surface, before argument export.
pub(crate) enum CallRequest {
    ImportScripts {
        urls: Vec<String>,
    },
    GetModuleExport {
        module_id: String,
        export_name: String,
    },
    CallModuleExport {
        module_id: String,
        export_name: String,
        args: Vec<Value>,
    },
    CallFunctionPointer {
        pointer: FunctionPointer,
        args: Vec<Value>,
    },
}

pub(crate) enum Command {
    Activate {
        reply: oneshot::Sender<Result<()>>,
    },
    Call {
        mode: SendMode,
        request: CallRequest,
        reply: oneshot::Sender<Result<Value>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
    /// Initialize hook finished; `epoch` guards against completions of a
    /// hook that was aborted by a reset in the meantime.
    InitHookDone {
        epoch: u64,
        result: core::result::Result<(), BoxError>,
    },
    /// A host callable invoked by the sandbox finished.
    CallableDone {
        epoch: u64,
        id: RequestId,
        result: core::result::Result<Value, BoxError>,
    },
}

enum Queued {
    /// A fully built request envelope; its caller already sits in the
    /// correlation table under the envelope's id.
    Send(Envelope),
    /// A bare "tell me when running" waiter (`activate`).
    Notify(oneshot::Sender<Result<()>>),
}

struct Link {
    outbound: mpsc::UnboundedSender<Envelope>,
    /// Dropping the handle detaches rather than aborts the pump: it winds
    /// down once the channels close, after draining any buffered terminate.
    _pump: JoinHandle<core::result::Result<(), BoxError>>,
}

enum Event {
    Command(Option<Command>),
    Message(Option<InboundItem>),
}

pub(crate) struct Driver {
    transport: Arc<dyn Transport>,
    state: LifecycleState,
    /// Incremented on every reset; stale completions from a previous sandbox
    /// instance are discarded by comparing against it.
    epoch: u64,
    link: Option<Link>,
    inbound: Option<mpsc::Receiver<InboundItem>>,
    pending: HashMap<RequestId, oneshot::Sender<Result<Value>>>,
    queue: VecDeque<Queued>,
    registry: CallableRegistry,
    next_id: RequestId,
    on_initialize: Option<Arc<InitHook>>,
    on_reset: Option<Arc<ResetHook>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    init_task: Option<JoinHandle<()>>,
    callable_tasks: Vec<JoinHandle<()>>,
}

impl Driver {
    pub(crate) fn spawn(
        transport: Arc<dyn Transport>,
        on_initialize: Option<Arc<InitHook>>,
        on_reset: Option<Arc<ResetHook>>,
    ) -> (mpsc::UnboundedSender<Command>, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let driver = Self {
            transport,
            state: LifecycleState::Initial,
            epoch: 0,
            link: None,
            inbound: None,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            registry: CallableRegistry::new(),
            next_id: RequestId::default(),
            on_initialize,
            on_reset,
            commands_tx: commands_tx.clone(),
            init_task: None,
            callable_tasks: Vec::new(),
        };
        let task = tokio::spawn(driver.run(commands_rx));
        (commands_tx, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = match &mut self.inbound {
                Some(inbound) => tokio::select! {
                    command = commands.recv() => Event::Command(command),
                    message = inbound.recv() => Event::Message(message),
                },
                None => Event::Command(commands.recv().await),
            };
            match event {
                Event::Command(None) => {
                    self.reset(ResetReason::Terminated);
                    return;
                }
                Event::Command(Some(command)) => {
                    if self.handle_command(command).await.is_break() {
                        return;
                    }
                }
                Event::Message(None) => self.reset(ResetReason::ChannelClosed),
                Event::Message(Some(Ok(envelope))) => self.handle_envelope(envelope),
                Event::Message(Some(Err(error))) => {
                    self.reset(ResetReason::Protocol(error.to_string()));
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Activate { reply } => {
                if self.state == LifecycleState::Running {
                    let _ = reply.send(Ok(()));
                } else {
                    self.queue.push_back(Queued::Notify(reply));
                    self.ensure_started().await;
                }
            }
            Command::Call {
                mode,
                request,
                reply,
            } => self.handle_call(mode, request, reply).await,
            Command::Reset { reply } => {
                self.reset(ResetReason::Terminated);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.reset(ResetReason::Terminated);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return ControlFlow::Break(());
            }
            Command::InitHookDone { epoch, result } => {
                if epoch == self.epoch && self.state == LifecycleState::Initializing {
                    self.init_task = None;
                    match result {
                        Ok(()) => self.finish_initialize(),
                        Err(error) => {
                            self.reset(ResetReason::InitializeFailed(error.to_string()));
                        }
                    }
                }
            }
            Command::CallableDone { epoch, id, result } => {
                if epoch == self.epoch {
                    let envelope = match result {
                        Ok(value) => Envelope::Respond {
                            id,
                            response: Some(marshal::export(value, &mut self.registry)),
                            error: None,
                        },
                        Err(error) => Envelope::Respond {
                            id,
                            response: None,
                            error: Some(WireValue::Error(ErrorRecord::new(
                                "Error",
                                error.to_string(),
                            ))),
                        },
                    };
                    self.send_envelope(envelope);
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_call(
        &mut self,
        mode: SendMode,
        request: CallRequest,
        reply: oneshot::Sender<Result<Value>>,
    ) {
        match mode {
            SendMode::Bootstrap if self.state != LifecycleState::Initializing => {
                let _ = reply.send(Err(Error::NotInitializing));
                return;
            }
            SendMode::Established
                if !matches!(
                    self.state,
                    LifecycleState::Initializing | LifecycleState::Running
                ) =>
            {
                let _ = reply.send(Err(Error::NotEstablished));
                return;
            }
            _ => {}
        }

        let id = self.allocate_id();
        let request = self.export_request(request);
        let envelope = Envelope::Request { id, request };
        self.pending.insert(id, reply);

        if mode == SendMode::Ready && self.state != LifecycleState::Running {
            self.queue.push_back(Queued::Send(envelope));
            self.ensure_started().await;
        } else {
            self.send_envelope(envelope);
        }
    }

    /// Allocate the next request id, skipping ids still awaiting a response
    /// so a long-lived processor can wrap without reusing an in-flight id.
    fn allocate_id(&mut self) -> RequestId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.next();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn export_request(&mut self, request: CallRequest) -> Request {
        match request {
            CallRequest::ImportScripts { urls } => Request::ImportScripts { urls },
            CallRequest::GetModuleExport {
                module_id,
                export_name,
            } => Request::GetModuleExport {
                module_id,
                export_name,
            },
            CallRequest::CallModuleExport {
                module_id,
                export_name,
                args,
            } => Request::CallModuleExport {
                module_id,
                export_name,
                args: self.export_args(args),
            },
            CallRequest::CallFunctionPointer { pointer, args } => Request::CallFunctionPointer {
                pointer,
                args: self.export_args(args),
            },
        }
    }

    fn export_args(&mut self, args: Vec<Value>) -> Vec<WireValue> {
        args.into_iter()
            .map(|arg| marshal::export(arg, &mut self.registry))
            .collect()
    }

    /// `Initial -> Loading`: spawn the isolated context and start listening.
    async fn ensure_started(&mut self) {
        if self.state != LifecycleState::Initial {
            return;
        }
        self.state = LifecycleState::Loading;
        tracing::debug!(target: TRACE_TARGET, "starting sandbox");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        match self.transport.connect(outbound_rx, inbound_tx).await {
            Ok(pump) => {
                self.link = Some(Link {
                    outbound: outbound_tx,
                    _pump: pump,
                });
                self.inbound = Some(inbound_rx);
            }
            Err(error) => self.reset(ResetReason::SpawnFailed(error.to_string())),
        }
    }

    fn send_envelope(&mut self, envelope: Envelope) {
        let delivered = self
            .link
            .as_ref()
            .is_some_and(|link| link.outbound.send(envelope).is_ok());
        if !delivered {
            self.reset(ResetReason::ChannelClosed);
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Initialized => {
                if self.state == LifecycleState::Loading {
                    self.begin_initialize();
                } else {
                    self.reset(ResetReason::Protocol(
                        "unsolicited initialized notification".to_string(),
                    ));
                }
            }
            Envelope::Respond {
                id,
                response,
                error,
            } => self.handle_respond(id, response, error),
            Envelope::Request { id, request } => self.handle_sandbox_request(id, request),
            Envelope::Error { error } => {
                self.reset(ResetReason::Crashed(describe_error_value(&error)));
            }
            Envelope::Terminate => {
                self.reset(ResetReason::Protocol(
                    "terminate envelope from sandbox".to_string(),
                ));
            }
        }
    }

    /// `Loading -> Initializing`: run the initialize hook off the driver so
    /// its bootstrap requests can be served while it executes.
    fn begin_initialize(&mut self) {
        self.state = LifecycleState::Initializing;
        tracing::debug!(target: TRACE_TARGET, "sandbox ready, initializing");

        let Some(hook) = self.on_initialize.clone() else {
            self.finish_initialize();
            return;
        };
        let future = hook(InitScope::new(self.commands_tx.clone()));
        let commands = self.commands_tx.clone();
        let epoch = self.epoch;
        self.init_task = Some(tokio::spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err("initialize hook panicked".into()),
            };
            let _ = commands.send(Command::InitHookDone { epoch, result });
        }));
    }

    /// `Initializing -> Running`: flush everything issued before the sandbox
    /// became available, in the order it was issued.
    fn finish_initialize(&mut self) {
        self.state = LifecycleState::Running;
        tracing::debug!(target: TRACE_TARGET, queued = self.queue.len(), "sandbox running");
        while let Some(entry) = self.queue.pop_front() {
            match entry {
                Queued::Send(envelope) => self.send_envelope(envelope),
                Queued::Notify(reply) => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    fn handle_respond(
        &mut self,
        id: RequestId,
        response: Option<WireValue>,
        error: Option<WireValue>,
    ) {
        let Some(reply) = self.pending.remove(&id) else {
            self.reset(ResetReason::Protocol(format!(
                "response for unknown request id {id}"
            )));
            return;
        };
        if response.is_some() && error.is_some() {
            // Mutual exclusivity violated: put the caller back so the reset
            // sweep settles it alongside everything else.
            self.pending.insert(id, reply);
            self.reset(ResetReason::Protocol(format!(
                "response and error both present for request id {id}"
            )));
            return;
        }

        let caller = RemoteCaller::new(self.commands_tx.clone());
        let result = match error {
            Some(error) => Err(error_from_value(marshal::hydrate(error, &caller))),
            None => Ok(marshal::hydrate(
                response.unwrap_or(WireValue::Null),
                &caller,
            )),
        };
        let _ = reply.send(result);
    }

    /// A reverse call from the sandbox against a host-registered callable.
    /// Failures here are answered to the one request and never escalate.
    fn handle_sandbox_request(&mut self, id: RequestId, request: Request) {
        let Request::CallFunctionPointer { pointer, args } = request else {
            self.respond_error(id, "TypeError", "unsupported request from sandbox");
            return;
        };
        let Some(callable) = self.registry.get(&pointer) else {
            self.respond_error(
                id,
                "ReferenceError",
                &format!("unknown function pointer {pointer}"),
            );
            return;
        };

        let caller = RemoteCaller::new(self.commands_tx.clone());
        let args: Vec<Value> = args
            .into_iter()
            .map(|arg| marshal::hydrate(arg, &caller))
            .collect();
        let commands = self.commands_tx.clone();
        let epoch = self.epoch;
        // Off the driver so a slow host callback cannot stall message
        // handling; the completion re-enters as an ordinary event.
        self.callable_tasks.push(tokio::spawn(async move {
            let result = match AssertUnwindSafe(callable.call(args)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err("host function panicked".into()),
            };
            let _ = commands.send(Command::CallableDone { epoch, id, result });
        }));
        self.callable_tasks.retain(|task| !task.is_finished());
    }

    fn respond_error(&mut self, id: RequestId, name: &str, message: &str) {
        self.send_envelope(Envelope::Respond {
            id,
            response: None,
            error: Some(WireValue::Error(ErrorRecord::new(name, message))),
        });
    }

    /// Unconditional return to `Initial`. Teardown side effects are applied
    /// before any caller is settled, so nobody can observe a handle into the
    /// dead context; the on-reset hook runs last.
    fn reset(&mut self, reason: ResetReason) {
        if self.state == LifecycleState::Initial {
            return;
        }
        if matches!(reason, ResetReason::Terminated) {
            tracing::debug!(target: TRACE_TARGET, %reason, "resetting sandbox");
        } else {
            tracing::warn!(target: TRACE_TARGET, %reason, "resetting sandbox");
        }

        // Best-effort terminate: the envelope is buffered ahead of the
        // channel closing, so the pump still delivers it if the context is
        // alive at all.
        if let Some(link) = self.link.take() {
            let _ = link.outbound.send(Envelope::Terminate);
        }
        self.inbound = None;
        self.state = LifecycleState::Initial;
        self.epoch += 1;
        if let Some(task) = self.init_task.take() {
            task.abort();
        }
        for task in self.callable_tasks.drain(..) {
            task.abort();
        }
        self.registry.clear();

        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(Error::Reset(reason.clone())));
        }
        for entry in self.queue.drain(..) {
            if let Queued::Notify(reply) = entry {
                let _ = reply.send(Err(Error::Reset(reason.clone())));
            }
        }

        if let Some(hook) = &self.on_reset {
            hook(&reason);
        }
    }
}

/// Render the payload of a fatal sandbox error notification.
fn describe_error_value(value: &WireValue) -> String {
    match value {
        WireValue::Text(text) => text.clone(),
        WireValue::Error(record) => format!("{}: {}", record.name, record.message),
        other => enclave_wire::to_json(other).unwrap_or_else(|_| format!("{other:?}")),
    }
}

/// Map an error payload hydrated from a `respond` envelope onto the
/// call-level error surfaced to the one caller.
fn error_from_value(value: Value) -> Error {
    match value {
        Value::Fault(fault) => Error::Sandbox {
            name: fault.name,
            message: fault.message,
        },
        Value::Text(message) => Error::Sandbox {
            name: "Error".to_string(),
            message,
        },
        other => Error::Sandbox {
            name: "Error".to_string(),
            message: format!("{other:?}"),
        },
    }
}
