//! Wire Protocol Implementation
//!
//! Everything needed to talk to the server at the byte level.
//!
//! ## Overview
//!
//! A connection starts with a handshake, after which both sides exchange
//! token-prefixed frames carrying JSON payloads. Several queries may be in
//! flight on one connection; the token tells their responses apart.
//!
//! ## Modules
//!
//! - `types`: Frames, query and response types, response decoding
//! - `parser`: Incremental parser for frames arriving off the socket
//! - `handshake`: The client side of the connection handshake
//!
//! ## Example
//!
//! ```
//! use docpool::protocol::{parse_frame, Frame, Response, ResponseType};
//!
//! let wire = Frame::new(4, r#"{"t":1,"r":[42]}"#).serialize();
//! let (frame, _) = parse_frame(&wire).unwrap().unwrap();
//! let response = Response::decode(&frame).unwrap();
//! assert_eq!(response.kind, ResponseType::SuccessAtom);
//! ```

pub mod handshake;
pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_frame, FrameParser, ParseError, ParseResult};
pub use types::{Frame, QueryType, Response, ResponseType};
