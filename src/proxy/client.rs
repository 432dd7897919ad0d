//! Master-side connection to an agent.
//!
//! [`AgentClient`] owns one TCP connection. Calls are multiplexed by id: the
//! writer half is shared behind a mutex, and a reader task routes every
//! inbound [`ReplyEnvelope`] to the channel of the call it answers. When the
//! connection drops, the pending map is torn down so every outstanding call
//! fails with a transport error instead of hanging.
//!
//! File bodies larger than one chunk are moved with several `read_file` or
//! `write_file` calls so no single line approaches the codec's limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ProfileConfig;
use crate::protocol::codec::{
    from_line, max_chunk_bytes, to_line, FrameCodec, DEFAULT_MAX_LINE_BYTES,
    DEFAULT_TRANSFER_CHUNK_BYTES,
};
use crate::protocol::{
    Completion, CreateDirectoryRequest, EnumerateRequest, EnumeratedItem, ExecuteRequest,
    ExecuteResponse, ExecuteStreamFrame, ReadFileRequest, Reply, ReplyEnvelope, Request,
    RequestEnvelope, WriteFileRequest,
};
use crate::{AppError, Result};

/// Reply routing table; `None` once the connection has closed.
type PendingMap = Arc<Mutex<Option<HashMap<u64, mpsc::UnboundedSender<Reply>>>>>;

/// Cloneable handle to one agent connection.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    peer: String,
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    pending: PendingMap,
    next_id: AtomicU64,
    chunk_bytes: usize,
    reader: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentClient")
            .field("peer", &self.inner.peer)
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    /// Open a connection, giving up after `timeout`.
    ///
    /// A single attempt is made; failures are surfaced, not retried.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the agent is unreachable or the
    /// timeout elapses.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        Self::connect_with_chunk(host, port, timeout, DEFAULT_TRANSFER_CHUNK_BYTES).await
    }

    async fn connect_with_chunk(
        host: &str,
        port: u16,
        timeout: Duration,
        chunk_bytes: usize,
    ) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(AppError::Transport(format!(
                    "cannot connect to agent at {peer}: {err}"
                )));
            }
            Err(_) => {
                return Err(AppError::Transport(format!(
                    "timed out after {}s connecting to agent at {peer}",
                    timeout.as_secs()
                )));
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "failed to set TCP_NODELAY");
        }
        info!(%peer, "connected to agent");
        Ok(Self::from_stream(stream, peer, chunk_bytes))
    }

    /// Open a connection to the agent described by `profile`.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::connect`].
    pub async fn connect_profile(profile: &ProfileConfig) -> Result<Self> {
        Self::connect_with_chunk(
            &profile.agent_host,
            profile.rpc_port,
            profile.connect_timeout(),
            profile.transfer_chunk_bytes,
        )
        .await
    }

    fn from_stream(stream: TcpStream, peer: String, chunk_bytes: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));

        let span = info_span!("agent_client", %peer);
        let reader = tokio::spawn(
            run_reader(
                FramedRead::new(read_half, FrameCodec::new()),
                Arc::clone(&pending),
            )
            .instrument(span),
        );

        Self {
            inner: Arc::new(ClientInner {
                peer,
                writer: Mutex::new(FramedWrite::new(write_half, FrameCodec::new())),
                pending,
                next_id: AtomicU64::new(1),
                chunk_bytes: chunk_bytes.clamp(1, max_chunk_bytes(DEFAULT_MAX_LINE_BYTES)),
                reader,
            }),
        }
    }

    /// Address this client talks to, as `host:port`.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Raw bytes moved per file transfer call.
    #[must_use]
    pub fn chunk_bytes(&self) -> usize {
        self.inner.chunk_bytes
    }

    /// Whether the connection has been lost.
    pub async fn is_closed(&self) -> bool {
        self.inner.pending.lock().await.is_none()
    }

    /// Send a request and return a handle yielding its replies.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the connection is closed or the
    /// request cannot be written.
    pub async fn call(&self, request: Request) -> Result<PendingCall> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let op = request.op_name();
        let line = to_line(&RequestEnvelope { id, request })?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = self.inner.pending.lock().await;
            let Some(map) = pending.as_mut() else {
                return Err(self.closed_error());
            };
            map.insert(id, tx);
        }

        debug!(call_id = id, op, "sending request");
        let sent = self.inner.writer.lock().await.send(line).await;
        if let Err(err) = sent {
            if let Some(map) = self.inner.pending.lock().await.as_mut() {
                map.remove(&id);
            }
            return Err(AppError::Transport(format!(
                "failed to send {op} request to {}: {err}",
                self.inner.peer
            )));
        }

        Ok(PendingCall {
            id,
            op,
            peer: self.inner.peer.clone(),
            replies: rx,
        })
    }

    /// Run a process remotely, handing each output frame to `on_frame` as
    /// it arrives.
    ///
    /// # Errors
    ///
    /// `AppError::Operation` when the agent reports a failure (including a
    /// timeout); `AppError::Transport`/`AppError::Protocol` for channel
    /// problems.
    pub async fn execute<F>(&self, request: ExecuteRequest, mut on_frame: F) -> Result<ExecuteResponse>
    where
        F: FnMut(ExecuteStreamFrame) + Send,
    {
        let mut call = self.call(Request::Execute(request)).await?;
        loop {
            match call.next().await? {
                Reply::Stream(frame) => on_frame(frame),
                Reply::Complete(Completion::Execute(response)) => return Ok(response),
                Reply::Complete(other) => return Err(call.unexpected(&other)),
                Reply::Failed(failure) => return Err(AppError::Operation(failure)),
            }
        }
    }

    /// Read a whole file from the agent's machine, one chunk per call.
    ///
    /// Reading stops at the size the agent reports, or early if the file
    /// shrinks underneath.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::execute`].
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let chunk = self.inner.chunk_bytes as u64;
        let mut contents = Vec::new();
        loop {
            let offset = contents.len() as u64;
            let request = Request::ReadFile(ReadFileRequest::range(path, offset, chunk));
            let file = match self.call(request).await?.finish().await? {
                Completion::ReadFile(file) => file,
                other => return Err(unexpected_completion("read_file", &other)),
            };

            let received = file.contents.len();
            contents.extend_from_slice(&file.contents);
            if received == 0 || contents.len() as u64 >= file.size {
                break;
            }
            debug!(path, offset, received, size = file.size, "read chunk");
        }
        Ok(contents)
    }

    /// Write a file on the agent's machine, one chunk per call.
    ///
    /// The target only appears once every chunk has arrived.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::execute`]; an existing target with
    /// `overwrite == false` fails with kind `already_exists`.
    pub async fn write_file(&self, path: &str, contents: Vec<u8>, overwrite: bool) -> Result<()> {
        if contents.len() <= self.inner.chunk_bytes {
            let request = Request::WriteFile(WriteFileRequest::whole(path, contents, overwrite));
            return self.finish_write(request).await;
        }

        let total = contents.len();
        let mut offset = 0;
        for chunk in contents.chunks(self.inner.chunk_bytes) {
            let last = offset + chunk.len() == total;
            let request = Request::WriteFile(WriteFileRequest::chunk(
                path,
                chunk.to_vec(),
                overwrite,
                offset as u64,
                last,
            ));
            self.finish_write(request).await?;
            debug!(path, offset, bytes = chunk.len(), last, "wrote chunk");
            offset += chunk.len();
        }
        Ok(())
    }

    async fn finish_write(&self, request: Request) -> Result<()> {
        match self.call(request).await?.finish().await? {
            Completion::WriteFile => Ok(()),
            other => Err(unexpected_completion("write_file", &other)),
        }
    }

    /// Create a directory (and parents) on the agent's machine.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::execute`].
    pub async fn create_directory(&self, path: &str) -> Result<()> {
        let request = Request::CreateDirectory(CreateDirectoryRequest { path: path.into() });
        match self.call(request).await?.finish().await? {
            Completion::CreateDirectory => Ok(()),
            other => Err(unexpected_completion("create_directory", &other)),
        }
    }

    /// List entries matching a glob on the agent's machine.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::execute`].
    pub async fn enumerate(&self, pattern: &str, recursive: bool) -> Result<Vec<EnumeratedItem>> {
        let request = Request::Enumerate(EnumerateRequest {
            pattern: pattern.into(),
            recursive,
        });
        match self.call(request).await?.finish().await? {
            Completion::Enumerate(response) => Ok(response.items),
            other => Err(unexpected_completion("enumerate", &other)),
        }
    }

    fn closed_error(&self) -> AppError {
        AppError::Transport(format!("connection to agent at {} is closed", self.inner.peer))
    }
}

/// Replies of one in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    op: &'static str,
    peer: String,
    replies: mpsc::UnboundedReceiver<Reply>,
}

impl PendingCall {
    /// Call id on the wire.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next reply.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the connection dropped before the
    /// terminal reply arrived.
    pub async fn next(&mut self) -> Result<Reply> {
        self.replies.recv().await.ok_or_else(|| {
            AppError::Transport(format!(
                "connection to agent at {} dropped while {} call {} was pending",
                self.peer, self.op, self.id
            ))
        })
    }

    /// Wait for the terminal reply of a call that does not stream.
    ///
    /// # Errors
    ///
    /// `AppError::Operation` for a failed call; `AppError::Protocol` if a
    /// stream frame arrives.
    pub async fn finish(mut self) -> Result<Completion> {
        match self.next().await? {
            Reply::Complete(completion) => Ok(completion),
            Reply::Failed(failure) => Err(AppError::Operation(failure)),
            Reply::Stream(_) => Err(AppError::Protocol(format!(
                "unexpected stream frame on {} call {}",
                self.op, self.id
            ))),
        }
    }

    fn unexpected(&self, completion: &Completion) -> AppError {
        unexpected_completion(self.op, completion)
    }
}

fn unexpected_completion(op: &str, completion: &Completion) -> AppError {
    AppError::Protocol(format!("{op} call answered with {completion:?}"))
}

/// Route inbound replies to their calls until the connection ends.
async fn run_reader(mut inbound: FramedRead<OwnedReadHalf, FrameCodec>, pending: PendingMap) {
    loop {
        let envelope = match inbound.next().await {
            None => {
                debug!("agent closed the connection");
                break;
            }
            Some(Err(err)) => {
                warn!(%err, "read failed, closing connection");
                break;
            }
            Some(Ok(line)) => match from_line::<ReplyEnvelope>(&line) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(%err, "discarding malformed reply");
                    continue;
                }
            },
        };

        let mut guard = pending.lock().await;
        let Some(map) = guard.as_mut() else {
            break;
        };
        let terminal = envelope.reply.is_terminal();
        match map.get(&envelope.id) {
            Some(tx) => {
                if tx.send(envelope.reply).is_err() || terminal {
                    map.remove(&envelope.id);
                }
            }
            None => debug!(call_id = envelope.id, "reply for unknown call"),
        }
    }

    let abandoned = pending.lock().await.take().map_or(0, |map| map.len());
    if abandoned > 0 {
        warn!(abandoned, "connection lost with calls pending");
    }
}
