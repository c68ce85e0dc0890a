//! Wire Frames, Query Types and Responses
//!
//! ## Frame Format
//!
//! Every message in either direction is one frame:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬─────────────────────────┐
//! │ token (u64, LE)  │ length (u32, LE) │ payload (length bytes)  │
//! └──────────────────┴──────────────────┴─────────────────────────┘
//! ```
//!
//! The token correlates a query with its response(s). Payloads are JSON:
//!
//! - query: `[type, term, optargs]` for START, `[type]` for the others
//! - response: `{"t": type, "r": [rows...], "n": [notes...]}`

use crate::error::DriverError;
use crate::protocol::parser::{ParseError, ParseResult};
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Value};
use std::fmt;

/// Size of the frame header (token + payload length).
pub const HEADER_LEN: usize = 12;

/// Handshake magic numbers
pub mod magic {
    /// Protocol version announced by the client
    pub const V0_4: u32 = 0x400c_2d20;
    /// Payload encoding announced by the client
    pub const JSON: u32 = 0x7e69_70c7;
}

/// Kind of query sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Start a new query
    Start = 1,
    /// Ask for the next batch of a partial result
    Continue = 2,
    /// Abandon a partial result
    Stop = 3,
    /// Wait until every noreply query on the connection has been processed
    NoreplyWait = 4,
    /// Ask the server to describe itself
    ServerInfo = 5,
}

impl QueryType {
    /// Numeric code on the wire.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Encodes a query carrying no term: `[type]`.
    pub fn bare_payload(self) -> Bytes {
        Bytes::from(format!("[{}]", self.code()))
    }
}

/// Kind of response returned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    SuccessAtom = 1,
    SuccessSequence = 2,
    /// More rows follow; send CONTINUE on the same token to get them
    SuccessPartial = 3,
    WaitComplete = 4,
    ServerInfo = 5,
    ClientError = 16,
    CompileError = 17,
    RuntimeError = 18,
}

impl ResponseType {
    /// Maps a wire code to a response type.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => ResponseType::SuccessAtom,
            2 => ResponseType::SuccessSequence,
            3 => ResponseType::SuccessPartial,
            4 => ResponseType::WaitComplete,
            5 => ResponseType::ServerInfo,
            16 => ResponseType::ClientError,
            17 => ResponseType::CompileError,
            18 => ResponseType::RuntimeError,
            _ => return None,
        })
    }

    /// Numeric code on the wire.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Returns true for the three error kinds.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError
        )
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseType::SuccessAtom => "success atom",
            ResponseType::SuccessSequence => "success sequence",
            ResponseType::SuccessPartial => "success partial",
            ResponseType::WaitComplete => "wait complete",
            ResponseType::ServerInfo => "server info",
            ResponseType::ClientError => "client error",
            ResponseType::CompileError => "compile error",
            ResponseType::RuntimeError => "runtime error",
        };
        f.write_str(name)
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub token: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(token: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            token,
            payload: payload.into(),
        }
    }

    /// Serializes the frame for sending over the wire.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.serialize_into(&mut buf);
        buf.freeze()
    }

    /// Appends the serialized frame to `buf`.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_u64_le(self.token);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

/// A decoded server response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub token: u64,
    pub kind: ResponseType,
    /// Result rows (`r`); an atom is a single row
    pub results: Vec<Value>,
    /// Notes attached by the server (`n`), e.g. changefeed markers
    pub notes: Vec<Value>,
    /// Query profile (`p`) when profiling was requested
    pub profile: Option<Value>,
}

impl Response {
    /// Decodes the JSON payload of a response frame.
    pub fn decode(frame: &Frame) -> ParseResult<Self> {
        let body: Value = serde_json::from_slice(&frame.payload)
            .map_err(|e| ParseError::InvalidPayload(e.to_string()))?;

        let code = body
            .get("t")
            .and_then(Value::as_i64)
            .ok_or(ParseError::MissingField("t"))?;
        let kind = ResponseType::from_code(code).ok_or(ParseError::UnknownResponseType(code))?;

        let results = match body.get("r") {
            Some(Value::Array(rows)) => rows.clone(),
            Some(_) => return Err(ParseError::InvalidPayload("`r` is not an array".to_string())),
            None if kind == ResponseType::WaitComplete => Vec::new(),
            None => return Err(ParseError::MissingField("r")),
        };

        let notes = match body.get("n") {
            Some(Value::Array(notes)) => notes.clone(),
            _ => Vec::new(),
        };

        Ok(Self {
            token: frame.token,
            kind,
            results,
            notes,
            profile: body.get("p").cloned(),
        })
    }

    /// Encodes the response as a frame (used by servers and tests).
    pub fn encode(&self) -> Frame {
        let mut body = json!({ "t": self.kind.code(), "r": self.results });
        if !self.notes.is_empty() {
            body["n"] = Value::Array(self.notes.clone());
        }
        if let Some(profile) = &self.profile {
            body["p"] = profile.clone();
        }
        Frame::new(self.token, body.to_string())
    }

    /// Builds a response of the given kind.
    pub fn new(token: u64, kind: ResponseType, results: Vec<Value>) -> Self {
        Self {
            token,
            kind,
            results,
            notes: Vec::new(),
            profile: None,
        }
    }

    /// The synthetic response returned for noreply queries.
    pub fn noreply(token: u64) -> Self {
        Self::new(token, ResponseType::SuccessAtom, Vec::new())
    }

    /// Returns true if more rows follow on the same token.
    pub fn is_partial(&self) -> bool {
        self.kind == ResponseType::SuccessPartial
    }

    /// Returns true if the server reported an error.
    pub fn is_error(&self) -> bool {
        self.kind.is_error()
    }

    /// The single value of an atom response.
    pub fn atom(&self) -> Option<&Value> {
        match self.kind {
            ResponseType::SuccessAtom | ResponseType::ServerInfo => self.results.first(),
            _ => None,
        }
    }

    /// Turns error responses into [`DriverError::Query`].
    pub fn into_result(self) -> Result<Self, DriverError> {
        if !self.is_error() {
            return Ok(self);
        }
        let message = match self.results.first() {
            Some(Value::String(msg)) => msg.clone(),
            Some(other) => other.to_string(),
            None => "no error message".to_string(),
        };
        Err(DriverError::Query {
            kind: self.kind,
            message,
        })
    }
}
