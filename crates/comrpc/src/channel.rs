//! Channels
//!
//! A channel is one bidirectional connection between two processes. Both
//! ends can call and be called; replies are matched to requests by
//! sequence number, so any number of calls can be in flight at once.
//!
//! ```text
//!            ┌──────────── reader task ─────────────────┐
//!  stream ──▶│ request  ──▶ queue ──▶ workers ──▶ stub  │──▶ writer ──▶ stream
//!            │ response ──▶ tail ──▶ pending call       │
//!            └──────────────────────────────────────────┘
//! ```
//!
//! The reader never runs user code itself: inbound requests go through a
//! FIFO queue drained by a fixed number of workers, so calls start in the
//! order they arrived and a stub that calls back into the peer can still
//! receive its own reply. Reference bookkeeping from a response tail is
//! done by the reader before it looks at the next message.

use crate::administrator::{Administrator, Dispatched, Loan};
use crate::config::ChannelConfig;
use crate::interface::InterfacePtr;
use crate::message::{
    AnnounceRequest, AnnounceResponse, Envelope, InvokeRequest, InvokeResponse, Message,
    MessageHeader, MessageKind,
};
use crate::transport::{BoxedStream, MessageTransport};
use crate::types::{method, ChannelId, Error, ErrorCode, InstanceId, InterfaceId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use comrpc_frame::Frame;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// Pending calls failed, references being returned
    Closing,
    Closed,
}

/// What to send back for an inbound announce
#[derive(Debug, Clone)]
pub struct AnnounceReply {
    pub response: AnnounceResponse,
    /// Close the channel once the response is written
    pub close: bool,
}

impl AnnounceReply {
    pub fn accept(response: AnnounceResponse) -> Self {
        Self {
            response,
            close: false,
        }
    }

    /// Answer with `result` and drop the connection
    pub fn reject(result: ErrorCode) -> Self {
        Self {
            response: AnnounceResponse::failure(result),
            close: true,
        }
    }
}

/// Receives announce requests and close notifications for a channel
#[async_trait]
pub trait AnnounceSink: Send + Sync {
    async fn announce(&self, channel: &Arc<Channel>, request: AnnounceRequest) -> AnnounceReply;

    /// Whether the peer on `channel` may invoke objects yet
    fn admits_invoke(&self, channel: ChannelId) -> bool {
        let _ = channel;
        true
    }

    /// Called once after the channel finished closing
    fn channel_closed(&self, channel: ChannelId) {
        let _ = channel;
    }
}

/// Channel statistics
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub requests_sent: AtomicU64,
    pub requests_received: AtomicU64,
    pub responses_received: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub timeouts: AtomicU64,
    /// Timed-out calls dropped without ever getting a reply
    pub abandoned: AtomicU64,
}

impl ChannelStats {
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of channel statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub requests_sent: u64,
    pub requests_received: u64,
    pub responses_received: u64,
    pub dispatch_failures: u64,
    pub timeouts: u64,
    pub abandoned: u64,
}

/// Objects kept alive until a reply has been consumed
#[derive(Default)]
pub(crate) struct Retained {
    /// Parameters loaned to the peer for the call
    _loans: Vec<Loan>,
    /// Objects whose references came back with the reply
    _released: Vec<InterfacePtr>,
}

type InvokeResult = Result<(InvokeResponse, Retained)>;

enum PendingReply {
    Invoke(oneshot::Sender<InvokeResult>),
    Announce(oneshot::Sender<Result<AnnounceResponse>>),
}

struct PendingCall {
    reply: PendingReply,
    /// Local objects passed in the request; handed to the caller with the reply
    keep_alive: Vec<Loan>,
    /// The caller stopped waiting
    timed_out: bool,
}

impl PendingCall {
    fn fail(self, error: Error) {
        match self.reply {
            PendingReply::Invoke(tx) => {
                let _ = tx.send(Err(error));
            }
            PendingReply::Announce(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct PendingCalls {
    next_sequence: u32,
    calls: HashMap<u32, PendingCall>,
    closed: bool,
}

struct Inbound {
    sequence: u32,
    request: InvokeRequest,
}

type InboundQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>>;

/// One end of a connection between two processes
pub struct Channel {
    id: ChannelId,
    peer: String,
    config: ChannelConfig,
    admin: Arc<Administrator>,
    sink: Option<Weak<dyn AnnounceSink>>,
    writer: tokio::sync::Mutex<MessageTransport<WriteHalf<BoxedStream>>>,
    pending: Mutex<PendingCalls>,
    state: watch::Sender<ChannelState>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    stats: ChannelStats,
}

impl Channel {
    /// Start a channel over `stream` and spawn its reader
    pub fn open(
        stream: BoxedStream,
        peer: impl Into<String>,
        admin: Arc<Administrator>,
        sink: Option<Weak<dyn AnnounceSink>>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = MessageTransport::new(read_half).with_max_message_size(config.max_message_size);
        let writer = MessageTransport::new(write_half).with_max_message_size(config.max_message_size);
        let (state, _) = watch::channel(ChannelState::Open);
        let (inbound, queue) = mpsc::unbounded_channel();
        let workers = config.worker_threads.max(1);

        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            config,
            admin,
            sink,
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(PendingCalls {
                next_sequence: 1,
                calls: HashMap::new(),
                closed: false,
            }),
            state,
            inbound: Mutex::new(Some(inbound)),
            stats: ChannelStats::default(),
        });
        debug!(
            "Channel {} opened to {} ({} workers)",
            channel.id, channel.peer, workers
        );

        let queue: InboundQueue = Arc::new(tokio::sync::Mutex::new(queue));
        for _ in 0..workers {
            tokio::spawn(channel.clone().run_worker(queue.clone()));
        }
        tokio::spawn(channel.clone().run_reader(reader));
        channel
    }

    /// Connected pair over an in-memory pipe
    pub fn loopback(
        first: Arc<Administrator>,
        second: Arc<Administrator>,
        config: ChannelConfig,
    ) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Self::open(Box::new(a), "loopback", first, None, config.clone()),
            Self::open(Box::new(b), "loopback", second, None, config),
        )
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn administrator(&self) -> &Arc<Administrator> {
        &self.admin
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// True from the moment closing starts
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Calls still waiting for a reply, timed-out ones included
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().calls.len()
    }

    /// Wait until the channel is fully closed
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        while *state.borrow_and_update() != ChannelState::Closed {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outbound

    fn register(&self, reply: PendingReply, keep_alive: Vec<Loan>) -> Result<u32> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(Error::ChannelClosed(self.id));
        }
        let mut sequence = pending.next_sequence;
        while sequence == 0 || pending.calls.contains_key(&sequence) {
            sequence = sequence.wrapping_add(1);
        }
        pending.next_sequence = sequence.wrapping_add(1);
        pending.calls.insert(
            sequence,
            PendingCall {
                reply,
                keep_alive,
                timed_out: false,
            },
        );
        Ok(sequence)
    }

    fn unregister(&self, sequence: u32) {
        // Loans end outside the lock
        let removed = self.pending.lock().calls.remove(&sequence);
        drop(removed);
    }

    /// Give a timed-out call until the late reply window closes
    fn abandon_later(self: &Arc<Self>, sequence: u32) {
        match self.pending.lock().calls.get_mut(&sequence) {
            Some(call) => call.timed_out = true,
            None => return,
        }
        let channel = Arc::downgrade(self);
        let window = self.config.late_reply_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(channel) = channel.upgrade() else {
                return;
            };
            let abandoned = {
                let mut pending = channel.pending.lock();
                match pending.calls.get(&sequence) {
                    Some(call) if call.timed_out => pending.calls.remove(&sequence),
                    _ => None,
                }
            };
            if let Some(call) = abandoned {
                channel.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Call {} on channel {}: no reply within {:?}, dropped",
                    sequence, channel.id, window
                );
                call.fail(Error::Timeout);
            }
        });
    }

    async fn send(self: &Arc<Self>, envelope: &Envelope) -> Result<()> {
        let result = self.writer.lock().await.write_message(envelope).await;
        if let Err(Error::Io(e)) = &result {
            debug!("Write on channel {} failed: {}", self.id, e);
            let channel = self.clone();
            tokio::spawn(async move { channel.close().await });
        }
        result
    }

    async fn request<T>(
        self: &Arc<Self>,
        message: Message,
        reply: PendingReply,
        rx: oneshot::Receiver<Result<T>>,
        keep_alive: Vec<Loan>,
        timeout: Duration,
    ) -> Result<T> {
        let sequence = self.register(reply, keep_alive)?;
        if let Err(e) = self.send(&Envelope::new(sequence, message)).await {
            self.unregister(sequence);
            return Err(e);
        }
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed(self.id)),
            Err(_) => {
                // The entry stays registered so a late reply is still applied
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Call {} on channel {} timed out after {:?}",
                    sequence, self.id, timeout
                );
                self.abandon_later(sequence);
                Err(Error::Timeout)
            }
        }
    }

    /// Send an invoke and wait for its response
    ///
    /// Loans in `keep_alive` stay in force until the reply has been
    /// consumed, the channel closes or a timed-out call is abandoned. They
    /// are returned alongside the response together with pointers released
    /// by the response tail.
    pub(crate) async fn invoke(
        self: &Arc<Self>,
        request: InvokeRequest,
        keep_alive: Vec<Loan>,
        timeout: Duration,
    ) -> InvokeResult {
        trace!(
            "Invoke {}:{} on {} over channel {}",
            request.interface,
            request.method,
            request.instance,
            self.id
        );
        let (tx, rx) = oneshot::channel();
        self.request(
            Message::InvokeRequest(request),
            PendingReply::Invoke(tx),
            rx,
            keep_alive,
            timeout,
        )
        .await
    }

    /// Send an announce and wait for its response
    pub async fn announce(self: &Arc<Self>, request: AnnounceRequest, timeout: Duration) -> Result<AnnounceResponse> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Message::AnnounceRequest(request),
            PendingReply::Announce(tx),
            rx,
            Vec::new(),
            timeout,
        )
        .await
    }

    /// Return `count` references on a remote instance
    pub async fn release_remote(self: &Arc<Self>, instance: InstanceId, interface: InterfaceId, count: u32) -> ErrorCode {
        let mut params = Frame::new();
        params.push_number(count);
        let request = InvokeRequest {
            instance,
            interface,
            method: method::RELEASE,
            params,
        };
        match self.invoke(request, Vec::new(), self.config.call_timeout).await {
            Ok((response, _)) => response.result,
            Err(e) => e.code(),
        }
    }

    // ---------------------------------------------------------------------
    // Inbound

    async fn run_reader(self: Arc<Self>, mut reader: MessageTransport<ReadHalf<BoxedStream>>) {
        let mut state = self.state.subscribe();
        loop {
            let frame = tokio::select! {
                biased;

                _ = Self::stopping(&mut state) => break,
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(data) => self.handle_frame(data).await,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("Channel {}: peer {} disconnected", self.id, self.peer);
                    break;
                }
                Err(e) => {
                    warn!("Channel {}: read failed: {}", self.id, e);
                    break;
                }
            }
        }
        self.close().await;
    }

    async fn run_worker(self: Arc<Self>, queue: InboundQueue) {
        loop {
            // The queue lock is fair, so workers take requests in arrival order
            let next = queue.lock().await.recv().await;
            let Some(Inbound { sequence, request }) = next else {
                break;
            };
            self.serve(sequence, request).await;
        }
    }

    fn admits_invoke(&self) -> bool {
        match &self.sink {
            None => true,
            Some(sink) => sink
                .upgrade()
                .map(|sink| sink.admits_invoke(self.id))
                .unwrap_or(false),
        }
    }

    async fn serve(self: &Arc<Self>, sequence: u32, request: InvokeRequest) {
        let Dispatched { response, delivery } = if self.admits_invoke() {
            self.admin.dispatch(self, request).await
        } else {
            warn!(
                "Channel {}: invoke on {} before the peer announced",
                self.id, request.instance
            );
            InvokeResponse::status(ErrorCode::Unavailable).into()
        };
        if !response.result.is_success() {
            self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        }

        delivery.ready().await;
        if let Err(e) = self
            .send(&Envelope::new(sequence, Message::InvokeResponse(response)))
            .await
        {
            debug!("Channel {}: response {} not sent: {}", self.id, sequence, e);
        }
        drop(delivery);
    }

    async fn stopping(state: &mut watch::Receiver<ChannelState>) {
        while *state.borrow_and_update() == ChannelState::Open {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, data: Bytes) {
        match Envelope::decode(&data) {
            Ok(envelope) => self.handle_message(envelope).await,
            Err(e) => {
                let Ok(header) = MessageHeader::decode(&data) else {
                    return;
                };
                warn!(
                    "Channel {}: undecodable message {}: {}",
                    self.id, header.sequence, e
                );
                if header.is_response() {
                    if let Some(call) = self.pending.lock().calls.remove(&header.sequence) {
                        call.fail(e);
                    }
                    return;
                }
                let message = match header.kind {
                    MessageKind::Invoke => Message::InvokeResponse(InvokeResponse::status(ErrorCode::BadRequest)),
                    MessageKind::Announce => {
                        Message::AnnounceResponse(AnnounceResponse::failure(ErrorCode::BadRequest))
                    }
                };
                let channel = self.clone();
                tokio::spawn(async move {
                    let _ = channel.send(&Envelope::new(header.sequence, message)).await;
                });
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, envelope: Envelope) {
        let sequence = envelope.sequence;
        match envelope.message {
            Message::InvokeRequest(request) => {
                self.stats.requests_received.fetch_add(1, Ordering::Relaxed);
                let queued = self
                    .inbound
                    .lock()
                    .as_ref()
                    .map(|inbound| inbound.send(Inbound { sequence, request }).is_ok())
                    .unwrap_or(false);
                if !queued {
                    debug!("Channel {}: request {} dropped while closing", self.id, sequence);
                }
            }
            Message::AnnounceRequest(request) => {
                self.stats.requests_received.fetch_add(1, Ordering::Relaxed);
                let channel = self.clone();
                tokio::spawn(async move {
                    let reply = match channel.sink.as_ref().and_then(Weak::upgrade) {
                        Some(sink) => sink.announce(&channel, request).await,
                        None => {
                            debug!("Channel {}: announce without a handler", channel.id);
                            AnnounceReply::reject(ErrorCode::Unavailable)
                        }
                    };
                    let sent = channel
                        .send(&Envelope::new(sequence, Message::AnnounceResponse(reply.response)))
                        .await;
                    if reply.close || sent.is_err() {
                        channel.close().await;
                    }
                });
            }
            Message::InvokeResponse(response) => {
                self.stats.responses_received.fetch_add(1, Ordering::Relaxed);
                let Some(call) = self.pending.lock().calls.remove(&sequence) else {
                    debug!("Channel {}: reply {} for unknown call", self.id, sequence);
                    return;
                };
                let PendingCall {
                    reply,
                    keep_alive: loans,
                    timed_out,
                } = call;
                if timed_out {
                    debug!("Channel {}: late reply {} applied", self.id, sequence);
                }
                let tx = match reply {
                    PendingReply::Invoke(tx) => tx,
                    PendingReply::Announce(tx) => {
                        let _ = tx.send(Err(Error::InvalidMessage(
                            "invoke reply to an announce".to_string(),
                        )));
                        return;
                    }
                };
                if response.tail.is_empty() {
                    let retained = Retained {
                        _loans: loans,
                        _released: Vec::new(),
                    };
                    let _ = tx.send(Ok((response, retained)));
                    return;
                }

                let owed = self.admin.settle_tail(self, &response.tail);
                // Releasing objects may call into other channels, or this one
                let channel = self.clone();
                tokio::spawn(async move {
                    channel.admin.finish_tail(&owed).await;
                    let retained = Retained {
                        _loans: loans,
                        _released: owed,
                    };
                    let _ = tx.send(Ok((response, retained)));
                });
            }
            Message::AnnounceResponse(response) => {
                self.stats.responses_received.fetch_add(1, Ordering::Relaxed);
                let Some(call) = self.pending.lock().calls.remove(&sequence) else {
                    debug!("Channel {}: announce reply {} for unknown call", self.id, sequence);
                    return;
                };
                match call.reply {
                    PendingReply::Announce(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    PendingReply::Invoke(tx) => {
                        let _ = tx.send(Err(Error::InvalidMessage(
                            "announce reply to an invoke".to_string(),
                        )));
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Teardown

    /// Close the channel
    ///
    /// Pending calls fail with [`Error::ChannelClosed`], proxies over this
    /// channel die and references the peer held are returned. Safe to call
    /// more than once; later calls wait for the first to finish.
    pub async fn close(&self) {
        let calls = {
            let mut pending = self.pending.lock();
            if pending.closed {
                None
            } else {
                pending.closed = true;
                Some(std::mem::take(&mut pending.calls))
            }
        };
        // Workers finish what is queued, then stop
        let inbound = self.inbound.lock().take();
        drop(inbound);
        let Some(calls) = calls else {
            self.closed().await;
            return;
        };

        self.state.send_replace(ChannelState::Closing);
        let failed = calls.len();
        for (_, call) in calls {
            call.fail(Error::ChannelClosed(self.id));
        }

        match tokio::time::timeout(self.config.call_timeout, self.writer.lock()).await {
            Ok(mut writer) => {
                let _ = writer.shutdown().await;
            }
            Err(_) => debug!("Channel {}: writer busy, not shut down", self.id),
        }

        let teardown = self.admin.delete_channel(self.id).await;
        self.state.send_replace(ChannelState::Closed);
        info!(
            "Channel {} to {} closed ({} calls failed, {} proxies dead)",
            self.id, self.peer, failed, teardown.proxies
        );

        if let Some(sink) = self.sink.as_ref().and_then(Weak::upgrade) {
            sink.channel_closed(self.id);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
