//! Wire frame encoding and decoding.
//!
//! Every frame is a single UTF-8 JSON object carrying a `type`, a `serial`,
//! and type-dependent payload fields. See the module-level docs in
//! [`crate::session`] for how frames flow through dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RpcError, RpcResult};

/// A decoded wire frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Request to invoke a route or function.
    Call {
        /// Correlation id chosen by the sender.
        serial: i64,
        /// Dotted-or-bare route/function name.
        call: String,
        /// Call arguments; absent means no arguments.
        #[serde(default)]
        arguments: Value,
    },
    /// Successful response to an earlier `call`.
    Callback {
        /// The serial of the `call` this responds to.
        serial: i64,
        /// The handler's return value.
        #[serde(default)]
        data: Value,
    },
    /// Failed response to an earlier `call`.
    Error {
        /// The serial of the `call` this responds to.
        serial: i64,
        /// `{type, message}`, or a bare string for legacy peers.
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    /// The `serial` field, common to every frame variant.
    pub fn serial(&self) -> i64 {
        match self {
            Frame::Call { serial, .. } | Frame::Callback { serial, .. } | Frame::Error { serial, .. } => *serial,
        }
    }
}

/// Normalized call arguments: positional, keyword, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    /// Positional arguments, in order.
    pub positional: Vec<Value>,
    /// Keyword arguments.
    pub keyword: serde_json::Map<String, Value>,
}

/// Split a decoded `arguments` value into positional/keyword form per §6's
/// grammar: `null` → none, array → positional, object → keyword, anything
/// else → a single positional argument.
pub fn prepare_args(arguments: Value) -> CallArgs {
    match arguments {
        Value::Null => CallArgs::default(),
        Value::Array(items) => CallArgs {
            positional: items,
            keyword: Default::default(),
        },
        Value::Object(map) => CallArgs {
            positional: Vec::new(),
            keyword: map,
        },
        scalar => CallArgs {
            positional: vec![scalar],
            keyword: Default::default(),
        },
    }
}

/// Encode a frame to the UTF-8 JSON text that goes on the wire.
pub fn encode(frame: &Frame) -> RpcResult<String> {
    serde_json::to_string(frame).map_err(RpcError::from)
}

/// Decode raw inbound text into a [`Frame`], rejecting it up front if it
/// exceeds `max_bytes` or is missing/has a negative serial.
pub fn decode(text: &str, max_bytes: usize) -> RpcResult<Frame> {
    if text.len() > max_bytes {
        return Err(RpcError::MalformedFrame(format!(
            "frame of {} bytes exceeds limit of {max_bytes}",
            text.len()
        )));
    }

    let raw: Value = serde_json::from_str(text)?;
    let serial = raw
        .get("serial")
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::MalformedFrame("missing or non-integer serial".into()))?;
    if serial < 0 {
        return Err(RpcError::MalformedFrame(format!(
            "negative serial {serial}"
        )));
    }

    // `type` defaults to `call` for backward compatibility with peers that omit it.
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("call")
        .to_string();

    match kind.as_str() {
        "call" => {
            let call = raw
                .get("call")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::BadArguments("call frame missing \"call\" name".into()))?
                .to_string();
            let arguments = raw.get("arguments").cloned().unwrap_or(Value::Null);
            Ok(Frame::Call {
                serial,
                call,
                arguments,
            })
        }
        "callback" => Ok(Frame::Callback {
            serial,
            data: raw.get("data").cloned().unwrap_or(Value::Null),
        }),
        "error" => Ok(Frame::Error {
            serial,
            data: raw.get("data").cloned().unwrap_or(Value::Null),
        }),
        other => Err(RpcError::MalformedFrame(format!(
            "unknown frame type {other:?}"
        ))),
    }
}

/// Compress a payload with raw deflate (no zlib/gzip header), as used for
/// permessage-deflate when a session has compression enabled.
pub fn deflate(data: &[u8]) -> RpcResult<Vec<u8>> {
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    encoder.finish().map_err(RpcError::from)
}

/// Inverse of [`deflate`].
pub fn inflate(data: &[u8]) -> RpcResult<Vec<u8>> {
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Pack a millisecond timestamp into the 8-byte big-endian control-frame
/// payload the keepalive ping uses.
pub fn pack_ping_token(millis: i64) -> [u8; 8] {
    millis.to_be_bytes()
}

/// Inverse of [`pack_ping_token`].
pub fn unpack_ping_token(data: &[u8]) -> RpcResult<i64> {
    let arr: [u8; 8] = data
        .try_into()
        .map_err(|_| RpcError::MalformedFrame(format!("pong payload of {} bytes, want 8", data.len())))?;
    Ok(i64::from_be_bytes(arr))
}
