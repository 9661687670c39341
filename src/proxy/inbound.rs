//! The client side of a request: response head, streamed body and the
//! observers that notice a client going away.
//!
//! # Design Decisions
//! - The handler task only waits for the response head; the dispatch task
//!   owns everything after that and keeps running if the client leaves
//! - Body chunks pass through a bounded queue, so a slow client suspends the
//!   writer instead of growing memory
//! - The request deadline is enforced on the client body too: when it passes,
//!   the client connection is torn down

use std::io;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::response::Parts;
use axum::http::Response;
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::http::response::{internal_error, request_timeout};
use crate::proxy::context::{ClientState, RequestContext};

type Frame = Result<Bytes, io::Error>;

const CLOSED_BEFORE_HEADERS: &str = "client disconnected before response headers";

/// Dispatch-side handle on the client connection.
pub struct InboundConnection {
    head: Option<oneshot::Sender<Response<Body>>>,
    client: Arc<ClientState>,
    deadline: Instant,
    queue_depth: usize,
}

/// Handler-side half: resolves to the response the client receives.
pub struct PendingResponse {
    head: oneshot::Receiver<Response<Body>>,
    deadline: Instant,
    observer: DisconnectObserver,
}

impl InboundConnection {
    pub fn open(ctx: &RequestContext, queue_depth: usize) -> (InboundConnection, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let client = ctx.client().clone();
        let inbound = InboundConnection {
            head: Some(tx),
            client: client.clone(),
            deadline: ctx.deadline(),
            queue_depth: queue_depth.max(1),
        };
        let pending = PendingResponse {
            head: rx,
            deadline: ctx.deadline(),
            observer: DisconnectObserver { client, armed: true },
        };
        (inbound, pending)
    }

    pub fn headers_sent(&self) -> bool {
        self.head.is_none()
    }

    /// Send a complete response. Returns false if headers were already sent
    /// or the client is gone.
    pub fn respond(&mut self, response: Response<Body>) -> bool {
        let Some(head) = self.head.take() else {
            return false;
        };
        if head.send(response).is_err() {
            self.client.mark_closed(CLOSED_BEFORE_HEADERS);
            return false;
        }
        self.client.mark_completed();
        true
    }

    /// Send the response head and get a writer for the body. `None` means
    /// the head was already sent or the client is gone.
    pub fn start_body(&mut self, head: Parts) -> Option<ClientWriter> {
        let sender = self.head.take()?;
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let (drained_tx, drained_rx) = oneshot::channel();

        let feed = BodyFeed {
            rx,
            deadline: self.deadline,
            guard: CompletionGuard {
                client: self.client.clone(),
                drained: Some(drained_tx),
            },
        };
        let response = Response::from_parts(head, Body::from_stream(feed.into_stream()));

        if sender.send(response).is_err() {
            self.client.mark_closed(CLOSED_BEFORE_HEADERS);
            return None;
        }

        Some(ClientWriter {
            tx,
            drained: drained_rx,
            client: self.client.clone(),
        })
    }
}

impl PendingResponse {
    /// Wait for the response head, bounded by the request deadline.
    pub async fn into_response(self, id: Value) -> Response<Body> {
        let PendingResponse {
            head,
            deadline,
            mut observer,
        } = self;

        let response = match timeout_at(deadline, head).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                tracing::error!("Dispatch ended without producing a response");
                internal_error(id)
            }
            Err(_) => {
                observer.client.mark_closed("request timeout");
                request_timeout(id)
            }
        };
        observer.armed = false;
        response
    }
}

/// Marks the client closed if the handler future is dropped while still
/// waiting for the head, which is how hyper reports an early disconnect.
struct DisconnectObserver {
    client: Arc<ClientState>,
    armed: bool,
}

impl Drop for DisconnectObserver {
    fn drop(&mut self) {
        if self.armed {
            self.client.mark_closed(CLOSED_BEFORE_HEADERS);
        }
    }
}

/// Writes body chunks to the client.
pub struct ClientWriter {
    tx: mpsc::Sender<Frame>,
    drained: oneshot::Receiver<()>,
    client: Arc<ClientState>,
}

impl ClientWriter {
    pub fn is_writable(&self) -> bool {
        !self.client.is_closed() && !self.tx.is_closed()
    }

    /// Queue a chunk, waiting while the queue is full. Returns false if the
    /// client is gone; the chunk is discarded.
    pub async fn write(&self, chunk: Bytes) -> bool {
        if !self.is_writable() {
            return false;
        }
        if self.tx.send(Ok(chunk)).await.is_err() {
            self.client.mark_closed("client connection closed during relay");
            return false;
        }
        true
    }

    /// End the body with an error so the client sees a truncated transfer
    /// rather than a clean end.
    pub async fn abort(self, error: io::Error) {
        let _ = self.tx.send(Err(error)).await;
    }

    /// End the body cleanly and wait until the client connection has taken
    /// every queued chunk. Returns false if the client went away first.
    pub async fn finish(self) -> bool {
        let ClientWriter { tx, drained, .. } = self;
        drop(tx);
        drained.await.is_ok()
    }
}

struct BodyFeed {
    rx: mpsc::Receiver<Frame>,
    deadline: Instant,
    guard: CompletionGuard,
}

impl BodyFeed {
    fn into_stream(self) -> impl Stream<Item = Frame> + Send + 'static {
        futures_util::stream::unfold(Some(self), |feed| async move {
            let mut feed = feed?;
            tokio::select! {
                biased;
                frame = feed.rx.recv() => match frame {
                    Some(Ok(chunk)) => Some((Ok(chunk), Some(feed))),
                    Some(Err(e)) => Some((Err(e), None)),
                    None => {
                        feed.guard.complete();
                        None
                    }
                },
                _ = sleep_until(feed.deadline) => {
                    feed.guard.client.mark_closed("request timeout");
                    Some((Err(io::Error::new(io::ErrorKind::TimedOut, "request timeout")), None))
                }
            }
        })
    }
}

/// Completion observer: fires when the body reaches its end, marks the client
/// closed when the body is dropped before that.
struct CompletionGuard {
    client: Arc<ClientState>,
    drained: Option<oneshot::Sender<()>>,
}

impl CompletionGuard {
    fn complete(&mut self) {
        self.client.mark_completed();
        if let Some(drained) = self.drained.take() {
            let _ = drained.send(());
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.drained.is_some() && !self.client.is_completed() {
            self.client.mark_closed("client connection closed during relay");
        }
    }
}
