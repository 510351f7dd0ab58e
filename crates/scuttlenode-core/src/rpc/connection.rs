//! Request multiplexer over one boxed stream
//!
//! ```text
//!            ┌─────────────┐  per-stream queues   ┌───────────┐
//! reader ───▶│  read loop  │─────────────────────▶│ RpcStream │
//!            └──────┬──────┘                      └───────────┘
//!                   │ new requests
//!                   ▼
//!            ┌─────────────┐                      ┌───────────┐
//!            │   Router    │──── handler tasks ──▶│ RpcSender │
//!            └─────────────┘                      └─────┬─────┘
//!                                                       │ send gate
//! writer ◀──────────────────── writer task ◀────────────┘
//! ```
//!
//! Streams are keyed by the request number as it appears on incoming
//! packets: `-n` for a request we opened as `n`, `m` for a request the
//! remote opened as `m`. Outgoing packets of a stream always carry the
//! negated key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::codec::{BodyType, Packet, RpcCodec, RpcFrame};
use super::message::{termination, Body, ErrorBody, ProcedureName, ProcedureType, Request};
use super::router::{IncomingRequest, Router};
use crate::boxstream::BoxFrame;
use crate::error::{NodeError, NodeResult};
use crate::identity::IdentityRef;

/// Queue length of each incoming stream.
const STREAM_QUEUE: usize = 128;

/// Queue length of the send gate.
const OUTGOING_QUEUE: usize = 256;

/// Outgoing frames are coalesced up to this many bytes per box write.
const WRITE_BATCH: usize = 64 * 1024;

enum Incoming {
    Body(Body),
    End(NodeError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Stream,
    Async,
}

struct StreamEntry {
    tx: mpsc::Sender<Incoming>,
    kind: EntryKind,
    local_ended: Arc<AtomicBool>,
    remote_ended: CancellationToken,
}

struct Shared {
    remote: IdentityRef,
    next_request: AtomicI32,
    streams: Mutex<HashMap<i32, StreamEntry>>,
    outgoing: mpsc::Sender<RpcFrame>,
    cancel: CancellationToken,
}

impl Shared {
    async fn send(&self, frame: RpcFrame) -> NodeResult<()> {
        if self.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        self.outgoing.send(frame).await.map_err(|_| NodeError::Cancelled)
    }

    /// Queue a frame from a synchronous context.
    fn send_detached(&self, frame: RpcFrame) {
        match self.outgoing.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let outgoing = self.outgoing.clone();
                    handle.spawn(async move {
                        let _ = outgoing.send(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn register(&self, key: i32, kind: EntryKind, local_ended: bool) -> Registration {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        let local_ended = Arc::new(AtomicBool::new(local_ended));
        let remote_ended = self.cancel.child_token();
        self.streams.lock().insert(
            key,
            StreamEntry {
                tx,
                kind,
                local_ended: local_ended.clone(),
                remote_ended: remote_ended.clone(),
            },
        );
        Registration {
            rx,
            local_ended,
            remote_ended,
        }
    }
}

struct Registration {
    rx: mpsc::Receiver<Incoming>,
    local_ended: Arc<AtomicBool>,
    remote_ended: CancellationToken,
}

fn end_frame(number: i32, stream: bool, error: Option<&str>) -> RpcFrame {
    let body = match error {
        Some(message) => serde_json::to_vec(&ErrorBody::new(message)).unwrap_or_default(),
        None => b"true".to_vec(),
    };
    RpcFrame::Packet(Packet {
        stream,
        end_or_error: true,
        body_type: BodyType::Json,
        request: number,
        body: body.into(),
    })
}

fn body_frame(number: i32, stream: bool, body: Body) -> RpcFrame {
    RpcFrame::Packet(Packet {
        stream,
        end_or_error: false,
        body_type: body.body_type(),
        request: number,
        body: body.into_bytes(),
    })
}

/// Sending half of one stream (or the reply slot of an async request).
pub struct RpcSender {
    shared: Arc<Shared>,
    number: i32,
    stream: bool,
    local_ended: Arc<AtomicBool>,
    remote_ended: CancellationToken,
}

impl RpcSender {
    /// Send one body. Fails once either side ended the stream.
    pub async fn send(&self, body: Body) -> NodeResult<()> {
        if self.local_ended.load(Ordering::Acquire) {
            return Err(NodeError::Protocol("stream already closed".to_string()));
        }
        if self.remote_ended.is_cancelled() {
            return Err(if self.shared.cancel.is_cancelled() {
                NodeError::Cancelled
            } else {
                NodeError::RemoteEnd
            });
        }
        self.shared.send(body_frame(self.number, self.stream, body)).await
    }

    /// Answer an async request.
    pub async fn respond(&self, body: Body) -> NodeResult<()> {
        if self.local_ended.swap(true, Ordering::AcqRel) {
            return Err(NodeError::Protocol("request already answered".to_string()));
        }
        self.shared.send(body_frame(self.number, false, body)).await
    }

    /// End the stream normally. Does nothing if it already ended.
    pub async fn close(&self) -> NodeResult<()> {
        if self.local_ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.send(end_frame(self.number, self.stream, None)).await
    }

    /// End the stream with an error. Does nothing if it already ended.
    pub async fn close_with_error(&self, message: &str) -> NodeResult<()> {
        if self.local_ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.send(end_frame(self.number, self.stream, Some(message))).await
    }

    /// Resolves once the remote ended the stream or the connection closed.
    pub async fn closed(&self) {
        self.remote_ended.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.local_ended.load(Ordering::Acquire) || self.remote_ended.is_cancelled()
    }
}

/// Receiving half of one stream.
///
/// Dropping it before the remote ended the stream sends a terminator.
pub struct RpcStream {
    shared: Arc<Shared>,
    key: i32,
    rx: mpsc::Receiver<Incoming>,
    local_ended: Arc<AtomicBool>,
    finished: bool,
}

impl RpcStream {
    /// Next body. Normal termination is reported as [`NodeError::RemoteEnd`],
    /// a closed connection as [`NodeError::Cancelled`].
    pub async fn next(&mut self) -> NodeResult<Body> {
        if self.finished {
            return Err(NodeError::RemoteEnd);
        }
        match self.rx.recv().await {
            Some(Incoming::Body(body)) => Ok(body),
            Some(Incoming::End(err)) => {
                self.finished = true;
                Err(err)
            }
            None => {
                self.finished = true;
                Err(NodeError::Cancelled)
            }
        }
    }

    pub fn request_number(&self) -> i32 {
        -self.key
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        let removed = self.shared.streams.lock().remove(&self.key).is_some();
        if removed && !self.finished && !self.local_ended.swap(true, Ordering::AcqRel) {
            self.shared.send_detached(end_frame(-self.key, true, None));
        }
    }
}

/// One multiplexed RPC connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Spawn the read loop and the writer task.
    ///
    /// Both stop when `cancel` fires or the transport closes; either way
    /// `cancel` ends up cancelled and every open stream is ended.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        remote: IdentityRef,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Self
    where
        R: Stream<Item = NodeResult<BoxFrame>> + Send + Unpin + 'static,
        W: Sink<BoxFrame, Error = NodeError> + Send + Unpin + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let shared = Arc::new(Shared {
            remote,
            next_request: AtomicI32::new(1),
            streams: Mutex::new(HashMap::new()),
            outgoing,
            cancel,
        });

        tokio::spawn(write_loop(writer, outgoing_rx, shared.cancel.clone()));
        tokio::spawn(read_loop(reader, shared.clone(), router));

        Self { shared }
    }

    pub fn remote(&self) -> IdentityRef {
        self.shared.remote
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Close the connection and every stream on it.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Number of streams currently open in either direction.
    pub fn open_streams(&self) -> usize {
        self.shared.streams.lock().len()
    }

    async fn open(
        &self,
        name: ProcedureName,
        typ: ProcedureType,
        args: Value,
    ) -> NodeResult<(i32, Registration)> {
        let number = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let kind = if typ.is_stream() {
            EntryKind::Stream
        } else {
            EntryKind::Async
        };
        let registration = self.shared.register(-number, kind, !typ.is_stream());
        let body = Body::json(&Request::new(name.clone(), typ, args))?;
        trace!(peer = %self.shared.remote, %name, %typ, number, "Opening request");
        if let Err(err) = self.shared.send(body_frame(number, typ.is_stream(), body)).await {
            self.shared.streams.lock().remove(&-number);
            return Err(err);
        }
        Ok((number, registration))
    }

    fn stream(&self, key: i32, registration: Registration) -> RpcStream {
        RpcStream {
            shared: self.shared.clone(),
            key,
            rx: registration.rx,
            local_ended: registration.local_ended,
            finished: false,
        }
    }

    /// Open a `source` request.
    pub async fn source(&self, name: ProcedureName, args: Value) -> NodeResult<RpcStream> {
        let (number, registration) = self.open(name, ProcedureType::Source, args).await?;
        Ok(self.stream(-number, registration))
    }

    /// Open a `duplex` request.
    pub async fn duplex(&self, name: ProcedureName, args: Value) -> NodeResult<(RpcSender, RpcStream)> {
        let (number, registration) = self.open(name, ProcedureType::Duplex, args).await?;
        let sender = RpcSender {
            shared: self.shared.clone(),
            number,
            stream: true,
            local_ended: registration.local_ended.clone(),
            remote_ended: registration.remote_ended.clone(),
        };
        Ok((sender, self.stream(-number, registration)))
    }

    /// Call an `async` procedure and wait for its single reply.
    pub async fn async_call(&self, name: ProcedureName, args: Value) -> NodeResult<Body> {
        let (number, registration) = self.open(name, ProcedureType::Async, args).await?;
        let mut reply = self.stream(-number, registration);
        reply.next().await
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<RpcFrame>, cancel: CancellationToken)
where
    W: Sink<BoxFrame, Error = NodeError> + Unpin,
{
    let mut codec = RpcCodec;
    let mut buf = BytesMut::new();
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = cancel.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        if codec.encode(frame, &mut buf).is_err() {
            break;
        }
        while buf.len() < WRITE_BATCH {
            match rx.try_recv() {
                Ok(frame) => {
                    if codec.encode(frame, &mut buf).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        if let Err(err) = writer.send(BoxFrame::Data(buf.split().freeze())).await {
            debug!(error = %err, "Write failed, closing connection");
            break;
        }
    }

    // Say goodbye on both layers; the remote may already be gone.
    let _ = codec.encode(RpcFrame::Goodbye, &mut buf);
    let _ = writer.send(BoxFrame::Data(buf.split().freeze())).await;
    let _ = writer.send(BoxFrame::Goodbye).await;
    let _ = writer.close().await;
    cancel.cancel();
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, router: Arc<Router>)
where
    R: Stream<Item = NodeResult<BoxFrame>> + Unpin,
{
    let mut codec = RpcCodec;
    let mut buf = BytesMut::new();
    let cancel = shared.cancel.clone();

    'outer: loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            None | Some(Ok(BoxFrame::Goodbye)) => {
                debug!(peer = %shared.remote, "Remote closed the connection");
                break;
            }
            Some(Err(err)) => {
                warn!(peer = %shared.remote, error = %err, "Connection failed");
                break;
            }
            Some(Ok(BoxFrame::Data(data))) => {
                buf.extend_from_slice(&data);
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(RpcFrame::Packet(packet))) => {
                            let handled = tokio::select! {
                                _ = cancel.cancelled() => break 'outer,
                                result = handle_packet(&shared, &router, packet) => result,
                            };
                            if let Err(err) = handled {
                                warn!(peer = %shared.remote, error = %err, "Bad packet");
                                break 'outer;
                            }
                        }
                        Ok(Some(RpcFrame::Goodbye)) => break 'outer,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(peer = %shared.remote, error = %err, "Bad packet framing");
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    cancel.cancel();
    shared.streams.lock().clear();
}

async fn handle_packet(shared: &Arc<Shared>, router: &Arc<Router>, packet: Packet) -> NodeResult<()> {
    let key = packet.request;
    let entry = shared.streams.lock().get(&key).map(|e| {
        (
            e.tx.clone(),
            e.kind,
            e.local_ended.clone(),
            e.remote_ended.clone(),
        )
    });
    let body = Body::from_packet(packet.body_type, packet.body)?;

    let Some((tx, kind, local_ended, remote_ended)) = entry else {
        if key > 0 && !packet.end_or_error {
            dispatch(shared, router, key, packet.stream, body);
        } else {
            trace!(peer = %shared.remote, request = key, "Packet for unknown stream");
        }
        return Ok(());
    };

    if !packet.end_or_error && kind == EntryKind::Stream {
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(Incoming::Body(body)) {
            // The read loop never waits on one stream; a reader this far behind loses it
            debug!(peer = %shared.remote, request = key, "Stream queue full, ending stream");
            shared.streams.lock().remove(&key);
            remote_ended.cancel();
            if !local_ended.swap(true, Ordering::AcqRel) {
                shared.send_detached(end_frame(-key, true, Some("stream queue overflow")));
            }
        }
        return Ok(());
    }

    shared.streams.lock().remove(&key);
    remote_ended.cancel();
    let item = if packet.end_or_error {
        if packet.stream && !local_ended.swap(true, Ordering::AcqRel) {
            shared.send(end_frame(-key, true, None)).await?;
        }
        Incoming::End(termination(&body))
    } else {
        Incoming::Body(body)
    };
    // Last item for this stream; wait for room off the read loop
    if let Err(mpsc::error::TrySendError::Full(item)) = tx.try_send(item) {
        tokio::spawn(async move {
            let _ = tx.send(item).await;
        });
    }
    Ok(())
}

fn dispatch(shared: &Arc<Shared>, router: &Arc<Router>, number: i32, stream: bool, body: Body) {
    let request: Request = match body.parse_json() {
        Ok(request) => request,
        Err(err) => {
            debug!(peer = %shared.remote, error = %err, "Unreadable request");
            shared.send_detached(end_frame(-number, stream, Some("invalid request")));
            return;
        }
    };

    let registration = if stream {
        shared.register(number, EntryKind::Stream, false)
    } else {
        let (_, rx) = mpsc::channel(1);
        Registration {
            rx,
            local_ended: Arc::new(AtomicBool::new(false)),
            remote_ended: shared.cancel.child_token(),
        }
    };
    let sender = RpcSender {
        shared: shared.clone(),
        number: -number,
        stream,
        local_ended: registration.local_ended.clone(),
        remote_ended: registration.remote_ended.clone(),
    };
    let inbound = match request.typ {
        ProcedureType::Duplex | ProcedureType::Sink => Some(RpcStream {
            shared: shared.clone(),
            key: number,
            rx: registration.rx,
            local_ended: registration.local_ended,
            finished: false,
        }),
        ProcedureType::Source | ProcedureType::Async => None,
    };

    let handler = router.resolve(&request);
    let remote = shared.remote;
    let cancel = shared.cancel.child_token();
    debug!(peer = %remote, name = %request.name, typ = %request.typ, number, "Incoming request");

    tokio::spawn(async move {
        let handler = match handler {
            Ok(handler) => handler,
            Err(err) => {
                let _ = sender.close_with_error(&err.message).await;
                return;
            }
        };
        let name = request.name.clone();
        let ctx = IncomingRequest {
            remote,
            request,
            sender,
            stream: inbound,
            cancel: cancel.clone(),
        };
        let sender = ctx.sender.clone_handle();
        let result = tokio::select! {
            result = handler.handle(ctx) => result,
            _ = cancel.cancelled() => Err(NodeError::Cancelled),
        };
        match result {
            Ok(()) => {
                let _ = sender.close().await;
            }
            Err(NodeError::Cancelled) => {}
            Err(err) => {
                debug!(peer = %remote, %name, error = %err, "Handler failed");
                let _ = sender.close_with_error(&err.to_string()).await;
            }
        }
    });
}

impl RpcSender {
    fn clone_handle(&self) -> RpcSender {
        RpcSender {
            shared: self.shared.clone(),
            number: self.number,
            stream: self.stream,
            local_ended: self.local_ended.clone(),
            remote_ended: self.remote_ended.clone(),
        }
    }
}
