//! Host-side value model for data crossing the sandbox boundary.
//!
//! Unlike [`enclave_wire::WireValue`], a [`Value`] can hold live host
//! callables. The marshaler turns those into opaque function pointers on the
//! way out and reconstructs sandbox-side pointers into callable handles on
//! the way in.

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A host function invocable from the sandbox (or a sandbox function
/// invocable from the host, once hydrated).
#[async_trait::async_trait]
pub trait Callable: Send + Sync + 'static {
    /// Number of declared parameters, carried as an arity hint when the
    /// callable is exported across the boundary.
    fn arity(&self) -> usize {
        0
    }

    async fn call(&self, args: Vec<Value>) -> core::result::Result<Value, BoxError>;
}

#[async_trait::async_trait]
impl<T: Callable + ?Sized> Callable for Arc<T> {
    fn arity(&self) -> usize {
        (**self).arity()
    }

    async fn call(&self, args: Vec<Value>) -> core::result::Result<Value, BoxError> {
        (**self).call(args).await
    }
}

/// An error-shaped value: carried across the boundary as data, not as a
/// failure of the call it travels in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub name: String,
    pub message: String,
}

impl Fault {
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl core::fmt::Display for Fault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for Fault {}

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Fault(Fault),
    Function(Arc<dyn Callable>),
}

impl Value {
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    #[must_use]
    pub fn function(callable: impl Callable) -> Self {
        Self::Function(Arc::new(callable))
    }

    #[must_use]
    pub fn fault(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fault(Fault::new(name, message))
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_function(&self) -> Option<&Arc<dyn Callable>> {
        match self {
            Self::Function(callable) => Some(callable),
            _ => None,
        }
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Self::Int(value) => f.debug_tuple("Int").field(value).finish(),
            Self::Float(value) => f.debug_tuple("Float").field(value).finish(),
            Self::Text(value) => f.debug_tuple("Text").field(value).finish(),
            Self::Bytes(value) => f.debug_tuple("Bytes").field(value).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Self::Fault(fault) => f.debug_tuple("Fault").field(fault).finish(),
            Self::Function(callable) => f
                .debug_tuple("Function")
                .field(&format_args!("<arity {}>", callable.arity()))
                .finish(),
        }
    }
}

/// Structural equality for data; callables compare by handle identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Fault(a), Self::Fault(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => {
                core::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self::Map(value)
    }
}

impl From<Fault> for Value {
    fn from(value: Fault) -> Self {
        Self::Fault(value)
    }
}
