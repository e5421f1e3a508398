//! ZMQ Frontend (`spec.md` §4.5).
//!
//! Two ROUTER sockets (receive, send) bound on configurable ports, each owned by a dedicated OS
//! thread performing a blocking poll+recv/send loop — the same dedicated-thread,
//! blocking-recv-dispatch-to-async-handler shape as the NNG example in
//! `other_examples/.../placeholder_chat__crates-bus-src-rpc.rs.rs`: the receive thread decodes a
//! wire message and hands dispatch to the (async) Query Processor via
//! `tokio::runtime::Handle::spawn`, with completions fed back to the send thread through a
//! `std::sync::mpsc`-based response queue.
//!
//! The receive and send threads share the shared [`AppRegistry`] populated by the Application
//! Registrar, the same table the HTTP frontend consults — a single source of truth for installed
//! applications rather than the spec's literal two separate maps.

mod arena;
mod queue;
mod routing;
mod wire;

pub use self::{
    arena::{ArenaError, PayloadArena},
    queue::{ResponseEnvelope, ResponseQueueReceiver, ResponseQueueSender},
    routing::ClientRouter,
    wire::{decode_request, encode_handshake_ack, encode_response, WireError, WireRequest},
};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use thiserror::Error;
use tokio::{runtime::Handle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    config::ZmqConfig,
    metrics::{Meter, MetricsError, MetricsRegistry},
    query::{processor::QueryProcessor, Query, QueryLineage},
    registrar::AppRegistry,
};

/// Poll timeout on both ROUTER sockets, used only so each thread can periodically re-check the
/// `active` flag during shutdown.
const POLL_TIMEOUT_MS: i32 = 200;
/// Receive thread drains at most this many messages per poll iteration (`spec.md` §4.5).
const RECV_BATCH: usize = 100;
/// Send thread drains at most this many response-queue entries per iteration (`spec.md` §4.5).
const SEND_BATCH: usize = 1_000;

/// Error starting the ZMQ frontend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ZmqError {
    /// A ROUTER socket failed to bind; fatal to the process per `spec.md` §7.
    #[error("failed to bind ZMQ {socket} socket to {addr}: {source}")]
    Bind {
        /// Which socket failed to bind.
        socket: &'static str,
        /// Address the socket attempted to bind to.
        addr: String,
        /// Underlying ZMQ error.
        source: zmq::Error,
    },
    /// The ZMQ context could not construct a socket.
    #[error("zmq context error: {0}")]
    Context(#[from] zmq::Error),
    /// A metric could not be registered.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// The running ZMQ frontend's dedicated receive and send threads.
pub struct ZmqFrontend {
    active: Arc<AtomicBool>,
    router: Arc<ClientRouter>,
    arena: PayloadArena,
    recv_thread: Option<JoinHandle<()>>,
    send_thread: Option<JoinHandle<()>>,
}

impl ZmqFrontend {
    /// Bind both ROUTER sockets and start the receive/send threads.
    ///
    /// Must be called from within a Tokio runtime context: the receive thread captures
    /// [`Handle::current`] to spawn prediction futures from its blocking loop.
    ///
    /// # Errors
    ///
    /// Returns `Err` if either socket fails to bind, matching `spec.md` §7's "fatal ZMQ bind
    /// failure" error kind.
    pub fn spawn(
        config: ZmqConfig,
        registry: Arc<AppRegistry>,
        processor: Arc<QueryProcessor>,
        metrics: &MetricsRegistry,
    ) -> Result<Self, ZmqError> {
        let ctx = zmq::Context::new();

        let recv_socket = ctx.socket(zmq::ROUTER)?;
        let recv_addr = format!("tcp://{}:{}", config.bind_addr, config.recv_port);
        recv_socket
            .bind(&recv_addr)
            .map_err(|source| ZmqError::Bind {
                socket: "recv",
                addr: recv_addr.clone(),
                source,
            })?;
        recv_socket.set_rcvtimeo(POLL_TIMEOUT_MS).ok();

        let send_socket = ctx.socket(zmq::ROUTER)?;
        let send_addr = format!("tcp://{}:{}", config.bind_addr, config.send_port);
        send_socket
            .bind(&send_addr)
            .map_err(|source| ZmqError::Bind {
                socket: "send",
                addr: send_addr.clone(),
                source,
            })?;
        send_socket.set_rcvtimeo(POLL_TIMEOUT_MS).ok();

        let active = Arc::new(AtomicBool::new(true));
        let router = Arc::new(ClientRouter::new());
        let arena = PayloadArena::new(config.arena_bytes);
        let (queue_tx, queue_rx) = queue::response_queue(config.queue_soft_cap);
        let (handshake_tx, handshake_rx) = std::sync::mpsc::channel::<Vec<u8>>();

        let drop_meter = metrics.create_meter("zmq.requests_dropped")?;
        let overflow_meter = metrics.create_meter("zmq.response_queue_overflow")?;
        let handle = Handle::current();

        let recv_thread = std::thread::Builder::new()
            .name("mlserve-zmq-recv".into())
            .spawn({
                let active = active.clone();
                move || {
                    recv_loop(
                        recv_socket,
                        active,
                        handle,
                        registry,
                        processor,
                        arena.clone(),
                        queue_tx,
                        handshake_tx,
                        drop_meter,
                    );
                }
            })
            .expect("failed to spawn ZMQ receive thread");

        let send_thread = std::thread::Builder::new()
            .name("mlserve-zmq-send".into())
            .spawn({
                let active = active.clone();
                let router = router.clone();
                move || {
                    send_loop(send_socket, active, router, handshake_rx, queue_rx, overflow_meter);
                }
            })
            .expect("failed to spawn ZMQ send thread");

        info!(%recv_addr, %send_addr, "ZMQ frontend bound");

        Ok(Self {
            active,
            router,
            arena,
            recv_thread: Some(recv_thread),
            send_thread: Some(send_thread),
        })
    }

    /// The shared client routing table, for diagnostics and tests.
    #[must_use]
    pub fn router(&self) -> Arc<ClientRouter> {
        self.router.clone()
    }

    /// The shared payload arena, for diagnostics and tests.
    #[must_use]
    pub fn arena(&self) -> PayloadArena {
        self.arena.clone()
    }

    /// Signal both threads to stop and join them.
    ///
    /// Per `spec.md` §4.5, both threads exit their poll loops within one poll timeout.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(thread) = self.recv_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.send_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ZmqFrontend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn recv_loop(
    socket: zmq::Socket,
    active: Arc<AtomicBool>,
    handle: Handle,
    registry: Arc<AppRegistry>,
    processor: Arc<QueryProcessor>,
    arena: PayloadArena,
    queue_tx: ResponseQueueSender,
    handshake_tx: std::sync::mpsc::Sender<Vec<u8>>,
    drop_meter: Arc<Meter>,
) {
    while active.load(Ordering::Acquire) {
        for _ in 0..RECV_BATCH {
            if !active.load(Ordering::Acquire) {
                return;
            }
            let frames = match socket.recv_multipart(0) {
                Ok(frames) => frames,
                Err(zmq::Error::EAGAIN) => break,
                Err(err) => {
                    warn!(error = %err, "zmq receive failed");
                    break;
                }
            };
            let Some((identity, payload)) = split_identity_frames(frames) else {
                continue;
            };
            if payload.is_empty() {
                let _ = handshake_tx.send(identity);
                continue;
            }
            handle_payload(
                &payload,
                &registry,
                &processor,
                &arena,
                &queue_tx,
                &handle,
                &drop_meter,
            );
        }
    }
}

/// ROUTER sockets prefix every message with the sender's identity frame, followed by the
/// zero-length delimiter the request layout in `spec.md` §4.5 describes, then the payload.
fn split_identity_frames(mut frames: Vec<Vec<u8>>) -> Option<(Vec<u8>, Vec<u8>)> {
    if frames.len() < 2 {
        return None;
    }
    let payload = frames.pop().unwrap_or_default();
    let identity = frames.into_iter().next().unwrap_or_default();
    Some((identity, payload))
}

fn handle_payload(
    payload: &[u8],
    registry: &Arc<AppRegistry>,
    processor: &Arc<QueryProcessor>,
    arena: &PayloadArena,
    queue_tx: &ResponseQueueSender,
    handle: &Handle,
    drop_meter: &Arc<Meter>,
) {
    let decoded = match decode_request(payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(error = %err, "dropping malformed ZMQ request");
            drop_meter.mark(1);
            return;
        }
    };
    let Some(record) = registry.get(&decoded.app_name) else {
        debug!(app = %decoded.app_name, "dropping ZMQ request for unknown application");
        drop_meter.mark(1);
        return;
    };
    let slot = match arena.reserve(payload) {
        Ok(slot) => slot,
        Err(err) => {
            warn!(error = %err, "payload arena exhausted, dropping request");
            drop_meter.mark(1);
            return;
        }
    };

    let mut lineage = QueryLineage::default();
    lineage.mark("zmq::recv");
    let deadline = Instant::now() + Duration::from_micros(record.latency_slo_micros);
    let query = Query {
        app_name: decoded.app_name,
        uid: decoded.client_id.to_string(),
        input: decoded.input,
        deadline,
        policy: record.policy.clone(),
        candidate_models: record.candidate_models.clone(),
        lineage,
    };

    let processor = processor.clone();
    let queue_tx = queue_tx.clone();
    let client_id = decoded.client_id;
    let request_id = decoded.request_id;
    handle.spawn(async move {
        let _slot = slot;
        match processor.predict(query).await {
            Ok(response) => {
                let overflowed = queue_tx.send(ResponseEnvelope {
                    client_id,
                    request_id,
                    output: response.output,
                    lineage: response.lineage,
                });
                if overflowed {
                    warn!(client_id, request_id, "response queue past soft cap");
                }
            }
            Err(err) => {
                warn!(client_id, request_id, error = %err, "dropping ZMQ request");
            }
        }
    });
}

fn send_loop(
    socket: zmq::Socket,
    active: Arc<AtomicBool>,
    router: Arc<ClientRouter>,
    handshake_rx: std::sync::mpsc::Receiver<Vec<u8>>,
    queue_rx: ResponseQueueReceiver,
    overflow_meter: Arc<Meter>,
) {
    while active.load(Ordering::Acquire) {
        let mut did_work = false;

        while let Ok(identity) = handshake_rx.try_recv() {
            did_work = true;
            let client_id = router.register(identity.clone());
            let ack = encode_handshake_ack(client_id);
            if let Err(err) = socket.send_multipart([identity, Vec::new(), ack], 0) {
                warn!(client_id, error = %err, "failed to send ZMQ handshake ack");
            }
        }

        for envelope in queue_rx.drain(SEND_BATCH) {
            did_work = true;
            let Some(identity) = router.identity_of(envelope.client_id) else {
                warn!(client_id = envelope.client_id, "no routing entry for response, dropping");
                overflow_meter.mark(1);
                continue;
            };
            let bytes = encode_response(envelope.request_id, envelope.output, &envelope.lineage);
            if let Err(err) = socket.send_multipart([identity, Vec::new(), bytes], 0) {
                warn!(
                    client_id = envelope.client_id,
                    error = %err,
                    "failed to send ZMQ response"
                );
            }
        }

        if !did_work {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
