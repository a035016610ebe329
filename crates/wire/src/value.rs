//! Recursive value model for payloads crossing the isolation boundary.
//!
//! Plain data maps onto CBOR directly. Callables and error objects cannot
//! cross the boundary as data; the marshaling layer replaces them with proxy
//! records — maps carrying a reserved `kind` tag — and this module folds
//! those records into explicit enum variants at decode time so the rest of
//! the host never sniffs map fields.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{
    Deserialize, Serialize,
    de::{self, MapAccess, SeqAccess, Visitor},
    ser::SerializeMap,
};

/// Reserved map key tagging a proxy record.
const PROXY_TAG: &str = "kind";

/// Opaque token identifying a callable registered on the side that exported
/// it. The minting side controls the format; tokens produced by this crate
/// carry an arity hint (`fn:<index>:<arity>`), tokens received from the
/// sandbox are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionPointer(String);

impl FunctionPointer {
    #[must_use]
    pub fn new(index: u64, arity: usize) -> Self {
        Self(format!("fn:{index}:{arity}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Arity hint carried by tokens in this crate's format, if any.
    #[must_use]
    pub fn arity(&self) -> Option<usize> {
        let rest = self.0.strip_prefix("fn:")?;
        rest.split_once(':')?.1.parse().ok()
    }
}

impl From<String> for FunctionPointer {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for FunctionPointer {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl core::fmt::Display for FunctionPointer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proxy record standing in for an error object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// A value as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    /// Proxy record for a callable (`{kind: "function", pointer}`).
    Function(FunctionPointer),
    /// Proxy record for an error object (`{kind: "error", name, message}`).
    Error(ErrorRecord),
}

impl WireValue {
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    #[must_use]
    pub fn into_map(self) -> Option<BTreeMap<String, WireValue>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

impl Serialize for WireValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Int(value) => serializer.serialize_i64(*value),
            Self::Float(value) => serializer.serialize_f64(*value),
            Self::Text(value) => serializer.serialize_str(value),
            Self::Bytes(value) => serializer.serialize_bytes(value),
            Self::List(items) => serializer.collect_seq(items),
            Self::Map(entries) => serializer.collect_map(entries),
            Self::Function(pointer) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(PROXY_TAG, "function")?;
                map.serialize_entry("pointer", pointer.as_str())?;
                map.end()
            }
            Self::Error(record) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry(PROXY_TAG, "error")?;
                map.serialize_entry("name", &record.name)?;
                map.serialize_entry("message", &record.message)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(WireValueVisitor)
    }
}

struct WireValueVisitor;

impl<'de> Visitor<'de> for WireValueVisitor {
    type Value = WireValue;

    fn expecting(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        formatter.write_str("a wire value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(WireValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(WireValue::Null)
    }

    fn visit_some<D: serde::Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(Self)
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> Result<Self::Value, E> {
        Ok(WireValue::Bool(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        Ok(WireValue::Int(value))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        i64::try_from(value).map_or(Ok(WireValue::Float(value as f64)), |v| Ok(WireValue::Int(v)))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
        Ok(WireValue::Float(value))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        Ok(WireValue::Text(value.to_string()))
    }

    fn visit_string<E: de::Error>(self, value: String) -> Result<Self::Value, E> {
        Ok(WireValue::Text(value))
    }

    fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Self::Value, E> {
        Ok(WireValue::Bytes(Bytes::copy_from_slice(value)))
    }

    fn visit_byte_buf<E: de::Error>(self, value: Vec<u8>) -> Result<Self::Value, E> {
        Ok(WireValue::Bytes(Bytes::from(value)))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(WireValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, WireValue>()? {
            entries.insert(key, value);
        }
        Ok(classify_map(entries))
    }
}

/// Fold a decoded map into a proxy variant when it carries a well-formed
/// proxy record; malformed records pass through as plain maps.
fn classify_map(mut entries: BTreeMap<String, WireValue>) -> WireValue {
    let kind = match entries.get(PROXY_TAG) {
        Some(WireValue::Text(kind)) => kind.clone(),
        _ => return WireValue::Map(entries),
    };
    match kind.as_str() {
        "function" => {
            if matches!(entries.get("pointer"), Some(WireValue::Text(_))) {
                let Some(WireValue::Text(pointer)) = entries.remove("pointer") else {
                    unreachable!()
                };
                WireValue::Function(FunctionPointer::from(pointer))
            } else {
                WireValue::Map(entries)
            }
        }
        "error" => {
            let name = match entries.remove("name") {
                Some(WireValue::Text(name)) => name,
                _ => "Error".to_string(),
            };
            let message = match entries.remove("message") {
                Some(WireValue::Text(message)) => message,
                _ => String::new(),
            };
            WireValue::Error(ErrorRecord { name, message })
        }
        _ => WireValue::Map(entries),
    }
}
