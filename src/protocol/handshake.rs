//! Client Handshake
//!
//! Runs once per connection, before any frame is exchanged:
//!
//! ```text
//! client ──> magic V0_4 (u32 LE) | key length (u32 LE) | key | magic JSON (u32 LE)
//! client <── "SUCCESS\0"   (or an error message terminated by NUL)
//! ```

use crate::error::DriverError;
use crate::protocol::types::magic;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Reply that opens the connection.
pub const SUCCESS: &str = "SUCCESS";

/// Upper bound on the server's handshake reply.
const MAX_REPLY_LEN: usize = 1024;

/// Encodes the client half of the handshake.
pub fn client_hello(auth_key: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(12 + auth_key.len());
    buf.put_u32_le(magic::V0_4);
    buf.put_u32_le(auth_key.len() as u32);
    buf.put_slice(auth_key.as_bytes());
    buf.put_u32_le(magic::JSON);
    buf
}

/// Performs the client handshake on a freshly connected stream.
pub async fn perform<S>(stream: &mut S, auth_key: &str) -> Result<(), DriverError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&client_hello(auth_key)).await?;
    stream.flush().await?;

    let reply = read_reply(stream).await?;
    trace!(reply = %reply, "handshake reply");

    if reply == SUCCESS {
        Ok(())
    } else {
        Err(DriverError::Handshake(reply))
    }
}

/// Reads a NUL-terminated reply.
async fn read_reply<S>(stream: &mut S) -> Result<String, DriverError>
where
    S: AsyncRead + Unpin,
{
    let mut reply = Vec::with_capacity(16);
    loop {
        let byte = match stream.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(DriverError::Handshake(
                    "connection closed during handshake".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        if byte == 0 {
            break;
        }
        if reply.len() >= MAX_REPLY_LEN {
            return Err(DriverError::Handshake("reply too long".to_string()));
        }
        reply.push(byte);
    }

    String::from_utf8(reply).map_err(|e| DriverError::Handshake(e.to_string()))
}
