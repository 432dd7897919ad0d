//! TCP listener serving agent calls.
//!
//! One task per connection reads [`RequestEnvelope`] lines and spawns one
//! task per call, so several calls can be in flight on a single connection.
//! All replies funnel through a single writer task; within one call the
//! stream frames are queued before the terminal reply, so the client always
//! sees them in that order.
//!
//! When the peer disconnects, in-flight calls are aborted. Dropping a call
//! kills any child process it started.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::protocol::codec::{from_line, to_line, FrameCodec};
use crate::protocol::{
    FailureKind, OperationFailure, Reply, ReplyEnvelope, Request, RequestEnvelope,
};
use crate::{AppError, Result};

/// Replies buffered per connection before call tasks wait on the writer.
const OUTBOUND_BUFFER: usize = 256;

/// Output frames buffered per `execute` call.
const FRAME_BUFFER: usize = 64;

/// Handle to a running agent listener.
#[derive(Debug)]
pub struct ServerHandle {
    /// Address actually bound; differs from the configured one for port `0`.
    pub local_addr: SocketAddr,
    /// Accept loop task; finishes after the cancellation token fires.
    pub join: JoinHandle<()>,
}

/// Bind the agent listener and spawn its accept loop.
///
/// # Errors
///
/// Returns `AppError::Transport` if the listener cannot be bound.
pub async fn spawn_agent_server(
    agent: Arc<Agent>,
    config: &AgentConfig,
    ct: CancellationToken,
) -> Result<ServerHandle> {
    let requested = SocketAddr::new(config.bind_address, config.port);
    let listener = TcpListener::bind(requested)
        .await
        .map_err(|err| AppError::Transport(format!("failed to bind {requested}: {err}")))?;
    let local_addr = listener.local_addr().map_err(|err| {
        AppError::Transport(format!("failed to read listener address: {err}"))
    })?;

    info!(%local_addr, root = %agent.root().display(), "agent listening");

    let max_line_bytes = config.max_line_bytes;
    let join = tokio::spawn(async move {
        let span = info_span!("agent_server", %local_addr);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("agent server shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let agent = Arc::clone(&agent);
                                let ct = ct.child_token();
                                tokio::spawn(handle_connection(stream, peer, agent, max_line_bytes, ct));
                            }
                            Err(err) => {
                                warn!(%err, "accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(ServerHandle { local_addr, join })
}

/// Serve one client connection until it closes or the token fires.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    agent: Arc<Agent>,
    max_line_bytes: usize,
    ct: CancellationToken,
) {
    let span = info_span!("agent_conn", %peer);
    async move {
        info!("connection opened");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let mut inbound = FramedRead::new(read_half, FrameCodec::with_max_line_bytes(max_line_bytes));
        let outbound = FramedWrite::new(write_half, FrameCodec::with_max_line_bytes(max_line_bytes));

        let (out_tx, out_rx) = mpsc::channel::<ReplyEnvelope>(OUTBOUND_BUFFER);
        let writer = tokio::spawn(run_writer(outbound, out_rx).in_current_span());
        let mut calls = JoinSet::new();

        loop {
            tokio::select! {
                () = ct.cancelled() => {
                    debug!("cancellation received, closing connection");
                    break;
                }
                Some(finished) = calls.join_next(), if !calls.is_empty() => {
                    if let Err(err) = finished {
                        if err.is_panic() {
                            warn!(%err, "call task panicked");
                        }
                    }
                }
                line = inbound.next() => {
                    match line {
                        None => {
                            debug!("peer closed the connection");
                            break;
                        }
                        Some(Err(err)) => {
                            warn!(%err, "read failed, closing connection");
                            break;
                        }
                        Some(Ok(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match from_line::<RequestEnvelope>(&line) {
                                Ok(envelope) => {
                                    let agent = Arc::clone(&agent);
                                    let out_tx = out_tx.clone();
                                    calls.spawn(
                                        serve_call(agent, envelope.id, envelope.request, out_tx)
                                            .in_current_span(),
                                    );
                                }
                                Err(err) => reject_line(&line, &err, &out_tx).await,
                            }
                        }
                    }
                }
            }
        }

        if !calls.is_empty() {
            info!(in_flight = calls.len(), "aborting in-flight calls");
        }
        calls.shutdown().await;
        drop(out_tx);
        if let Err(err) = writer.await {
            warn!(%err, "writer task failed");
        }
        info!("connection closed");
    }
    .instrument(span)
    .await;
}

/// Run one call: forward its frames, then send the terminal reply.
async fn serve_call(
    agent: Arc<Agent>,
    id: u64,
    request: Request,
    out_tx: mpsc::Sender<ReplyEnvelope>,
) {
    let span = info_span!("agent_call", id, op = request.op_name());
    async move {
        let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_BUFFER);

        let forward = async {
            while let Some(frame) = frame_rx.recv().await {
                let envelope = ReplyEnvelope {
                    id,
                    reply: Reply::Stream(frame),
                };
                if out_tx.send(envelope).await.is_err() {
                    debug!("connection writer gone, dropping output");
                    break;
                }
            }
        };

        let (outcome, ()) = tokio::join!(agent.handle(request, frame_tx), forward);

        let reply = match outcome {
            Ok(completion) => Reply::Complete(completion),
            Err(failure) => Reply::Failed(failure),
        };
        if out_tx.send(ReplyEnvelope { id, reply }).await.is_err() {
            debug!("connection writer gone, terminal reply dropped");
        }
    }
    .instrument(span)
    .await;
}

/// Answer an unparsable request line when its call id can be recovered.
async fn reject_line(line: &str, err: &AppError, out_tx: &mpsc::Sender<ReplyEnvelope>) {
    let id = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64));

    let Some(id) = id else {
        warn!(%err, "discarding request without a call id");
        return;
    };

    warn!(id, %err, "rejecting malformed request");
    let failure = OperationFailure::new(FailureKind::InvalidRequest, "malformed request")
        .with_detail(err.to_string());
    let envelope = ReplyEnvelope {
        id,
        reply: Reply::Failed(failure),
    };
    if out_tx.send(envelope).await.is_err() {
        debug!("connection writer gone, rejection dropped");
    }
}

/// Serialize replies onto the socket in channel order.
async fn run_writer(
    mut outbound: FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>,
    mut out_rx: mpsc::Receiver<ReplyEnvelope>,
) {
    while let Some(envelope) = out_rx.recv().await {
        let line = match to_line(&envelope) {
            Ok(line) => line,
            Err(err) => {
                warn!(id = envelope.id, %err, "failed to serialize reply");
                continue;
            }
        };
        if let Err(err) = outbound.send(line).await {
            warn!(%err, "write failed, stopping writer");
            break;
        }
    }

    if let Err(err) = outbound.close().await {
        debug!(%err, "failed to close connection cleanly");
    }
}
