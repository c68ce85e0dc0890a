//! Multiplexed Server Connection
//!
//! One [`Connection`] owns one TCP session. Many queries can be in flight on it
//! at once; each gets a fresh token and a one-slot [`RendezvousQueue`] that the
//! reader task fills when the matching response arrives.
//!
//! ## Request Lifecycle
//!
//! ```text
//!  caller                        Connection                     reader task
//!    │ run(query)                    │                               │
//!    │──────────────────────────────>│ allocate token                │
//!    │                               │ register slot + waiter        │
//!    │                               │ write frame ──────> server    │
//!    │  (suspended on slot.pull())   │                               │
//!    │                               │          server ──> frame     │
//!    │                               │<──────────────────────────────│ dispatch(token)
//!    │<──────────────────────────────│ slot.push(response)           │
//! ```
//!
//! ## Teardown
//!
//! Whoever first moves the state out of `Open` (the reader on EOF or a read
//! error, a writer on a write error, or an explicit `close()`) flushes every
//! outstanding slot with `Err(ConnectionClosed)` and shuts the socket.
//!
//! A caller always registers its waiter before checking the state, so a
//! teardown can never flush a slot nobody is waiting on yet and leave the
//! caller suspended forever.

use crate::connection::options::{ConnectionOptions, ServerAddress};
use crate::connection::state::{ConnectionState, StateCell};
use crate::connection::stats::PoolStats;
use crate::error::{DriverError, Result};
use crate::protocol::{handshake, Frame, FrameParser, QueryType, Response, ResponseType};
use crate::query::Query;
use crate::queue::{Pull, RendezvousQueue};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where the response(s) for one token are delivered.
type ReplySlot = RendezvousQueue<Result<Response>>;

/// A query waiting for its response.
struct PendingRequest {
    slot: ReplySlot,
    query_type: QueryType,
    created_at: Instant,
}

/// Token allocation and the outstanding requests keyed by token.
struct TokenTable {
    next_token: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl TokenTable {
    /// Next token not held by an outstanding request.
    fn allocate(&mut self) -> u64 {
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if !self.pending.contains_key(&token) {
                return token;
            }
        }
    }
}

/// Forgets a token when its caller stops waiting before the reply arrives.
struct Withdraw<'a> {
    conn: &'a Connection,
    token: u64,
    armed: bool,
}

impl<'a> Withdraw<'a> {
    fn new(conn: &'a Connection, token: u64) -> Self {
        Self {
            conn,
            token,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.forget(self.token);
        }
    }
}

/// A client connection to one server.
pub struct Connection {
    id: u64,
    server: ServerAddress,
    options: ConnectionOptions,
    state: StateCell,
    tokens: Mutex<TokenTable>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Connects to `server`, performs the handshake and starts the reader task.
    pub async fn open(
        server: ServerAddress,
        options: ConnectionOptions,
        stats: Arc<PoolStats>,
    ) -> Result<Arc<Self>> {
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            server,
            options,
            state: StateCell::new(ConnectionState::Connecting),
            tokens: Mutex::new(TokenTable {
                next_token: 1,
                pending: HashMap::new(),
            }),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            stats,
        });

        debug!(conn = conn.id, server = %conn.server, "connecting");

        let stream = match conn.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                conn.state.set(ConnectionState::Closed);
                conn.stats.connect_failed();
                debug!(conn = conn.id, server = %conn.server, error = %e, "connect failed");
                return Err(e);
            }
        };

        let (read_half, write_half) = stream.into_split();
        *conn.writer.lock().await = Some(write_half);

        if !conn
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Open)
        {
            // Closed while the handshake was running
            conn.state.set(ConnectionState::Closed);
            return Err(DriverError::ConnectionClosed);
        }

        conn.stats.connection_opened();
        let reader = tokio::spawn(Arc::clone(&conn).read_loop(read_half));
        *lock(&conn.reader) = Some(reader);

        info!(conn = conn.id, server = %conn.server, "connection open");
        Ok(conn)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let limit = self.options.connect_timeout;
        let attempt = async {
            let mut stream =
                TcpStream::connect((self.server.host.as_str(), self.server.port)).await?;
            stream.set_nodelay(true)?;
            handshake::perform(&mut stream, &self.options.auth_key).await?;
            Ok::<_, DriverError>(stream)
        };

        match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(limit)),
        }
    }

    /// Process-unique id, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server(&self) -> &ServerAddress {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == ConnectionState::Open
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.tokens).pending.len()
    }

    /// Age of the longest-waiting request.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        lock(&self.tokens)
            .pending
            .values()
            .map(|p| p.created_at.elapsed())
            .max()
    }

    /// Sends a query and returns its first response.
    ///
    /// If the response is partial, the token stays registered and the rest can
    /// be fetched with [`continue_query`](Self::continue_query). Noreply queries
    /// resolve as soon as they are written.
    pub async fn send(&self, query: &Query) -> Result<Response> {
        let payload = query.compile()?;

        if query.is_noreply() {
            if !self.is_open() {
                return Err(DriverError::ConnectionClosed);
            }
            let token = lock(&self.tokens).allocate();
            self.write_frame(token, payload).await?;
            return Ok(Response::noreply(token));
        }

        self.request(QueryType::Start, payload).await
    }

    /// Sends a query and collects every batch into one response.
    pub async fn run(&self, query: &Query) -> Result<Response> {
        let mut response = self.send(query).await?.into_result()?;

        while response.is_partial() {
            let batch = self.continue_query(response.token).await?.into_result()?;
            response.results.extend(batch.results);
            response.kind = batch.kind;
            response.notes = batch.notes;
            if batch.profile.is_some() {
                response.profile = batch.profile;
            }
        }

        Ok(response)
    }

    /// Asks for the next batch of a partial result.
    pub async fn continue_query(&self, token: u64) -> Result<Response> {
        self.follow_up(token, QueryType::Continue).await
    }

    /// Abandons a partial result.
    pub async fn stop_query(&self, token: u64) -> Result<Response> {
        self.follow_up(token, QueryType::Stop).await
    }

    /// Waits until the server has processed every noreply query sent on this connection.
    pub async fn noreply_wait(&self) -> Result<()> {
        let response = self
            .request(QueryType::NoreplyWait, QueryType::NoreplyWait.bare_payload())
            .await?
            .into_result()?;
        match response.kind {
            ResponseType::WaitComplete => Ok(()),
            other => Err(DriverError::Protocol(format!(
                "unexpected {} in reply to noreply_wait",
                other
            ))),
        }
    }

    /// Asks the server to describe itself.
    pub async fn server_info(&self) -> Result<serde_json::Value> {
        let response = self
            .request(QueryType::ServerInfo, QueryType::ServerInfo.bare_payload())
            .await?
            .into_result()?;
        response
            .atom()
            .cloned()
            .ok_or_else(|| DriverError::Protocol("empty server info".to_string()))
    }

    /// Registers a new token, writes the payload, and waits for the reply.
    async fn request(&self, query_type: QueryType, payload: Bytes) -> Result<Response> {
        let slot = ReplySlot::new();
        let reply = slot.pull();

        let token = {
            let mut tokens = lock(&self.tokens);
            let token = tokens.allocate();
            tokens.pending.insert(
                token,
                PendingRequest {
                    slot,
                    query_type,
                    created_at: Instant::now(),
                },
            );
            token
        };

        if !self.is_open() {
            self.forget(token);
            return Err(DriverError::ConnectionClosed);
        }

        trace!(conn = self.id, token, ?query_type, "request registered");
        let withdraw = Withdraw::new(self, token);
        self.write_frame(token, payload).await?;
        let response = self.await_reply(token, reply).await;
        withdraw.disarm();
        response
    }

    /// Sends CONTINUE or STOP for a token that is still registered.
    async fn follow_up(&self, token: u64, query_type: QueryType) -> Result<Response> {
        let slot = lock(&self.tokens).pending.get(&token).map(|p| p.slot.clone());
        let Some(slot) = slot else {
            if !self.is_open() {
                return Err(DriverError::ConnectionClosed);
            }
            return Err(DriverError::Protocol(format!(
                "no partial result outstanding for token {}",
                token
            )));
        };

        let reply = slot.pull();
        if !self.is_open() {
            return Err(DriverError::ConnectionClosed);
        }

        let withdraw = Withdraw::new(self, token);
        self.write_frame(token, query_type.bare_payload()).await?;
        let response = self.await_reply(token, reply).await;
        withdraw.disarm();
        response
    }

    async fn await_reply(&self, token: u64, reply: Pull<Result<Response>>) -> Result<Response> {
        let Some(limit) = self.options.query_timeout else {
            return reply.await;
        };

        match tokio::time::timeout(limit, reply).await {
            Ok(result) => result,
            Err(_) => {
                warn!(conn = self.id, token, ?limit, "query timed out");
                self.abandon(token).await;
                Err(DriverError::Timeout(limit))
            }
        }
    }

    /// Drops a timed-out request and tells the server to stop working on it.
    async fn abandon(&self, token: u64) {
        let Some(pending) = self.forget(token) else {
            return;
        };
        if pending.query_type == QueryType::Start && self.is_open() {
            let _ = self
                .write_frame(token, QueryType::Stop.bare_payload())
                .await;
        }
    }

    fn forget(&self, token: u64) -> Option<PendingRequest> {
        lock(&self.tokens).pending.remove(&token)
    }

    async fn write_frame(&self, token: u64, payload: Bytes) -> Result<()> {
        let bytes = Frame::new(token, payload).serialize();

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(DriverError::ConnectionClosed);
        };
        let result: std::io::Result<()> = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        }
        .await;
        drop(writer);

        match result {
            Ok(()) => {
                self.stats.query_sent(bytes.len());
                trace!(conn = self.id, token, bytes = bytes.len(), "frame written");
                Ok(())
            }
            Err(e) => {
                warn!(conn = self.id, error = %e, "write failed");
                self.shutdown(&format!("write failed: {}", e)).await;
                Err(DriverError::ConnectionClosed)
            }
        }
    }

    /// Reads frames until the socket fails, then tears the connection down.
    async fn read_loop(self: Arc<Self>, mut stream: OwnedReadHalf) {
        let parser = FrameParser::with_max_frame_size(self.options.max_frame_size);
        let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);

        let reason = 'read: loop {
            loop {
                match parser.parse(&buffer) {
                    Ok(Some((frame, consumed))) => {
                        let _ = buffer.split_to(consumed);
                        self.dispatch(frame);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conn = self.id, error = %e, "unreadable frame");
                        break 'read format!("protocol error: {}", e);
                    }
                }
            }

            if buffer.capacity() - buffer.len() < 1024 {
                buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            match stream.read_buf(&mut buffer).await {
                Ok(0) => break "closed by server".to_string(),
                Ok(n) => {
                    self.stats.bytes_read(n);
                    trace!(conn = self.id, bytes = n, "read data");
                }
                Err(e) => break format!("read failed: {}", e),
            }
        };

        self.shutdown(&reason).await;
    }

    /// Routes one inbound frame to the request holding its token.
    fn dispatch(&self, frame: Frame) {
        self.stats.response_received();
        let token = frame.token;
        let decoded = Response::decode(&frame);

        let slot = {
            let mut tokens = lock(&self.tokens);
            let keep = matches!(&decoded, Ok(response) if response.is_partial());
            if keep {
                tokens.pending.get(&token).map(|p| p.slot.clone())
            } else {
                tokens.pending.remove(&token).map(|p| p.slot)
            }
        };

        let Some(slot) = slot else {
            self.stats.unmatched_frame();
            warn!(conn = self.id, token, "response for unknown token");
            return;
        };

        match decoded {
            Ok(response) => {
                trace!(conn = self.id, token, kind = %response.kind, "response dispatched");
                slot.push(Ok(response));
            }
            Err(e) => {
                warn!(conn = self.id, token, error = %e, "malformed response");
                slot.push(Err(e.into()));
            }
        }
    }

    /// Closes the connection, failing every outstanding request.
    pub async fn close(&self) {
        if !self.state.begin_close() {
            return;
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        self.finish_close("closed by client").await;
    }

    async fn shutdown(&self, reason: &str) {
        if self.state.begin_close() {
            self.finish_close(reason).await;
        }
    }

    async fn finish_close(&self, reason: &str) {
        let drained: Vec<PendingRequest> = lock(&self.tokens)
            .pending
            .drain()
            .map(|(_, pending)| pending)
            .collect();

        let flushed: usize = drained
            .iter()
            .map(|pending| pending.slot.destroy(Err(DriverError::ConnectionClosed)))
            .sum();

        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }

        self.state.set(ConnectionState::Closed);
        self.stats.connection_closed();
        info!(
            conn = self.id,
            server = %self.server,
            reason,
            flushed,
            "connection closed"
        );
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("state", &self.state.get())
            .finish()
    }
}
