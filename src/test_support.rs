//! In-process fake server for tests.
//!
//! Speaks the handshake and framing and answers START terms according to a
//! small script language:
//!
//! | term                              | behaviour                                        |
//! |-----------------------------------|--------------------------------------------------|
//! | `{"sleep": ms, "echo": v}`        | answer `v` after `ms` milliseconds               |
//! | `{"die": true}`                   | drop the connection without answering            |
//! | `{"error": "msg"}`                | runtime error response                           |
//! | `{"stream": n}`                   | `n` partial batches, one row each, via CONTINUE  |
//! | `{"garbage": true}`               | malformed payload on the query's token           |
//! | `{"orphan": v}`                   | frame for an unknown token, then answer `v`      |
//! | `{"silent": true}`                | never answer                                     |
//! | anything else                     | echo the term as an atom                         |

use crate::connection::ServerAddress;
use crate::protocol::types::magic;
use crate::protocol::{Frame, FrameParser, Response, ResponseType};
use bytes::BytesMut;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

pub(crate) struct TestServer {
    pub(crate) addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl TestServer {
    pub(crate) async fn start() -> Self {
        Self::start_with_key("").await
    }

    pub(crate) async fn start_with_key(auth_key: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let auth_key = auth_key.to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, auth_key.clone()));
            }
        });

        Self { addr, accepted }
    }

    pub(crate) fn address(&self) -> ServerAddress {
        ServerAddress::new("127.0.0.1", self.addr.port())
    }

    /// Number of TCP connections accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// An address nothing listens on.
pub(crate) async fn dead_address() -> ServerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ServerAddress::new("127.0.0.1", port)
}

type Writer = Arc<Mutex<OwnedWriteHalf>>;

async fn accept_handshake(stream: &mut TcpStream, auth_key: &str) -> std::io::Result<bool> {
    let version = stream.read_u32_le().await?;
    let key_len = stream.read_u32_le().await? as usize;
    let mut key = vec![0u8; key_len];
    stream.read_exact(&mut key).await?;
    let protocol = stream.read_u32_le().await?;

    if version != magic::V0_4 || protocol != magic::JSON || key != auth_key.as_bytes() {
        stream
            .write_all(b"ERROR: Incorrect authorization key.\0")
            .await?;
        return Ok(false);
    }

    stream.write_all(b"SUCCESS\0").await?;
    Ok(true)
}

async fn serve(mut stream: TcpStream, auth_key: String) {
    match accept_handshake(&mut stream, &auth_key).await {
        Ok(true) => {}
        _ => return,
    }

    let (mut reader, writer) = stream.into_split();
    let writer: Writer = Arc::new(Mutex::new(writer));
    let parser = FrameParser::new();
    let mut buffer = BytesMut::with_capacity(4096);
    // token -> (next row, total rows)
    let mut streams: HashMap<u64, (u64, u64)> = HashMap::new();

    loop {
        while let Ok(Some((frame, consumed))) = parser.parse(&buffer) {
            let _ = buffer.split_to(consumed);
            if !handle_frame(frame, &writer, &mut streams).await {
                let _ = writer.lock().await.shutdown().await;
                return;
            }
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn reply(writer: &Writer, response: Response) {
    write_frame(writer, response.encode()).await;
}

async fn write_frame(writer: &Writer, frame: Frame) {
    let _ = writer.lock().await.write_all(&frame.serialize()).await;
}

/// Returns false when the connection should be dropped.
async fn handle_frame(
    frame: Frame,
    writer: &Writer,
    streams: &mut HashMap<u64, (u64, u64)>,
) -> bool {
    let token = frame.token;
    let Ok(query) = serde_json::from_slice::<Value>(&frame.payload) else {
        return true;
    };

    match query[0].as_u64() {
        Some(1) => {}
        Some(2) => {
            let Some((next, total)) = streams.get_mut(&token) else {
                return true;
            };
            let row = json!(*next);
            *next += 1;
            let kind = if *next >= *total {
                streams.remove(&token);
                ResponseType::SuccessSequence
            } else {
                ResponseType::SuccessPartial
            };
            reply(writer, Response::new(token, kind, vec![row])).await;
            return true;
        }
        Some(3) => {
            streams.remove(&token);
            reply(writer, Response::new(token, ResponseType::SuccessSequence, vec![])).await;
            return true;
        }
        Some(4) => {
            reply(writer, Response::new(token, ResponseType::WaitComplete, vec![])).await;
            return true;
        }
        Some(5) => {
            let info = json!({"id": "00000000-test", "name": "test_server", "proxy": false});
            reply(writer, Response::new(token, ResponseType::ServerInfo, vec![info])).await;
            return true;
        }
        _ => return true,
    }

    let term = query[1].clone();
    if query[2]["noreply"] == json!(true) {
        return true;
    }

    if term["die"] == json!(true) {
        return false;
    }
    if term["silent"] == json!(true) {
        return true;
    }
    if let Some(ms) = term["sleep"].as_u64() {
        let writer = Arc::clone(writer);
        let value = term["echo"].clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            reply(&writer, Response::new(token, ResponseType::SuccessAtom, vec![value])).await;
        });
        return true;
    }
    if let Some(msg) = term["error"].as_str() {
        let response = Response::new(token, ResponseType::RuntimeError, vec![json!(msg)]);
        reply(writer, response).await;
        return true;
    }
    if let Some(total) = term["stream"].as_u64() {
        let kind = if total <= 1 {
            ResponseType::SuccessSequence
        } else {
            streams.insert(token, (1, total));
            ResponseType::SuccessPartial
        };
        reply(writer, Response::new(token, kind, vec![json!(0)])).await;
        return true;
    }
    if term["garbage"] == json!(true) {
        write_frame(writer, Frame::new(token, "not json")).await;
        return true;
    }
    if !term["orphan"].is_null() {
        let stray = Response::new(token + 1_000_000, ResponseType::SuccessAtom, vec![json!(0)]);
        reply(writer, stray).await;
        let value = term["orphan"].clone();
        reply(writer, Response::new(token, ResponseType::SuccessAtom, vec![value])).await;
        return true;
    }

    reply(writer, Response::new(token, ResponseType::SuccessAtom, vec![term])).await;
    true
}
