//! Wire protocol spoken between the host and a sandboxed extension runtime.
//!
//! Every message crossing the isolation boundary is a tagged [`Envelope`].
//! The host issues [`Request`]s and the sandbox answers each with exactly one
//! `respond` envelope carrying the same id; the sandbox may in turn issue
//! `callFunctionPointer` requests against callables the host exported to it.
//! Envelopes are encoded as CBOR on the wire ([`to_cbor`]/[`from_cbor`]);
//! [`to_json`] renders them for diagnostics with byte strings as base64.

mod value;

use std::io::{self, Write as _};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error as ThisError;

pub use value::{ErrorRecord, FunctionPointer, WireValue};

/// Result type used by `enclave-wire` APIs.
pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("JSON serialization error")]
    Json(#[from] serde_json::Error),
    #[error("CBOR decode error")]
    CborDecode(#[from] minicbor_serde::error::DecodeError),
    #[error("CBOR encode error")]
    CborEncode(#[from] minicbor_serde::error::EncodeError<core::convert::Infallible>),
    #[error("UTF-8 encoding error")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Correlation id for a request envelope.
///
/// Ids are minted by whichever side issues the request and echoed back in the
/// matching `respond` envelope. The magnitude is capped below 2^53 so the id
/// survives transports whose number type is a double-precision float.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const MAX: Self = Self((1 << 53) - 1);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The id following this one, wrapping to zero at [`Self::MAX`].
    #[must_use]
    pub const fn next(self) -> Self {
        if self.0 >= Self::MAX.0 {
            Self(0)
        } else {
            Self(self.0 + 1)
        }
    }
}

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Operation carried by a `request` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Load additional code into the sandbox by URL.
    ImportScripts { urls: Vec<String> },
    /// Read a named export of a loaded module.
    GetModuleExport {
        module_id: String,
        export_name: String,
    },
    /// Invoke a named export of a loaded module.
    CallModuleExport {
        module_id: String,
        export_name: String,
        args: Vec<WireValue>,
    },
    /// Invoke a callable previously exported across the boundary.
    CallFunctionPointer {
        pointer: FunctionPointer,
        args: Vec<WireValue>,
    },
}

/// A single message crossing the isolation boundary.
///
/// Direction determines the valid subset: the host sends `request`, `respond`
/// and `terminate`; the sandbox sends `initialized`, `respond`, `request`
/// (reverse calls only) and `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Unsolicited notification that the sandbox runtime finished booting.
    Initialized,
    Request {
        id: RequestId,
        request: Request,
    },
    /// Answer to a prior request. `response` and `error` are mutually
    /// exclusive; both absent means the request succeeded with no value.
    Respond {
        id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<WireValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireValue>,
    },
    /// Fatal sandbox-side failure not tied to any single request.
    Error {
        error: WireValue,
    },
    /// Best-effort teardown notice; the sandbox must not reply.
    Terminate,
}

/// Encode a protocol value as CBOR bytes.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut serializer = minicbor_serde::Serializer::new(Vec::new());
    value.serialize(serializer.serialize_unit_as_null(true))?;
    Ok(serializer.into_encoder().into_writer())
}

/// Decode a protocol value from CBOR bytes.
///
/// # Errors
/// Returns an error if deserialization fails.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut deserializer = minicbor_serde::Deserializer::new(bytes);
    Ok(T::deserialize(&mut deserializer)?)
}

/// Render a protocol value as JSON for logs and tooling.
///
/// Byte strings are emitted as base64, so the output is for diagnostics, not
/// for feeding back into [`from_cbor`].
///
/// # Errors
/// Returns an error if serialization fails.
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut out = vec![];
    value.serialize(&mut serde_json::Serializer::with_formatter(
        &mut out,
        Base64Formatter,
    ))?;
    Ok(String::from_utf8(out)?)
}

struct Base64Formatter;

impl serde_json::ser::Formatter for Base64Formatter {
    fn write_byte_array<W>(&mut self, mut writer: &mut W, value: &[u8]) -> io::Result<()>
    where
        W: io::Write + ?Sized,
    {
        writer.write_all(b"\"")?;
        base64::write::EncoderWriter::new(&mut writer, &base64::engine::general_purpose::STANDARD)
            .write_all(value)?;
        writer.write_all(b"\"")
    }
}
