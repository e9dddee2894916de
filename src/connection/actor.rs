//! The connection state machine (§4.3): a single task owns both the write
//! and read sides, selecting over inbound commands, inbound bytes, and
//! expired deadlines. This is the "single task" realization permitted by
//! §9 rather than the split write/read-task-plus-channel alternative;
//! either preserves the ordering and cancellation contracts of §5.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::command::CommandKind;
use crate::connection::pending::PendingEntry;
use crate::error::{ClientError, ClientResult, ServerError, ServerErrorKind, TimingError, TransportError};
use crate::resp::{encode_command, RespToken};
use crate::subscription::filter::{FilterEntry, FilterState, SubscriptionFilter};
use crate::subscription::SubscriptionMessage;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub struct SendRequest {
    pub payload: bytes::Bytes,
    pub kind: CommandKind,
    pub timeout: Option<Duration>,
}

pub struct SubscribeRequest {
    pub filters: Vec<SubscriptionFilter>,
    pub subscriber_id: u64,
    pub msg_tx: mpsc::UnboundedSender<SubscriptionMessage>,
}

pub struct UnsubscribeRequest {
    pub filters: Vec<SubscriptionFilter>,
    pub subscriber_id: u64,
}

enum ActorMessage {
    Send(SendRequest, oneshot::Sender<ClientResult<RespToken>>),
    SubscribeAdd(SubscribeRequest, oneshot::Sender<ClientResult<()>>),
    SubscribeRemove(UnsubscribeRequest),
    Shutdown,
}

/// A cheap, cloneable reference to a running connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    tx: mpsc::UnboundedSender<ActorMessage>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, req: SendRequest) -> ClientResult<RespToken> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ActorMessage::Send(req, tx)).is_err() {
            return Err(ClientError::Transport(TransportError::ConnectionClosed));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transport(TransportError::ConnectionClosed)),
        }
    }

    pub async fn subscribe(&self, req: SubscribeRequest) -> ClientResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ActorMessage::SubscribeAdd(req, tx)).is_err() {
            return Err(ClientError::Transport(TransportError::ConnectionClosed));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transport(TransportError::ConnectionClosed)),
        }
    }

    pub fn unsubscribe(&self, req: UnsubscribeRequest) {
        let _ = self.tx.send(ActorMessage::SubscribeRemove(req));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ActorMessage::Shutdown);
    }
}

/// Allocates the next request id used to track deadlines in the heap.
fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

struct FifoEntry {
    entry: PendingEntry,
    acks_remaining: usize,
}

struct ConnectionActor<S> {
    stream: S,
    read_buf: BytesMut,
    pending: VecDeque<FifoEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    filters: HashMap<SubscriptionFilter, FilterEntry>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<SubscriptionMessage>>,
    subscribe_acks: HashMap<u64, oneshot::Sender<ClientResult<()>>>,
    closing: bool,
    closed_flag: Arc<AtomicBool>,
}

impl<S> ConnectionActor<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ActorMessage>) {
        loop {
            let next_deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);
            tokio::select! {
                biased;
                msg = cmd_rx.recv() => {
                    match msg {
                        Some(ActorMessage::Send(req, reply_tx)) => self.handle_send(req, reply_tx).await,
                        Some(ActorMessage::SubscribeAdd(req, reply_tx)) => self.handle_subscribe_add(req, reply_tx).await,
                        Some(ActorMessage::SubscribeRemove(req)) => self.handle_subscribe_remove(req).await,
                        Some(ActorMessage::Shutdown) | None => self.begin_closing(),
                    }
                }
                result = self.stream.read_buf(&mut self.read_buf), if !self.closing => {
                    match result {
                        Ok(0) => self.begin_closing(),
                        Ok(_) => { let _ = self.drain_frames().await; }
                        Err(_) => self.begin_closing(),
                    }
                }
                _ = sleep_until_opt(next_deadline), if next_deadline.is_some() => {
                    self.handle_timeout();
                }
            }

            if self.closing && self.pending.is_empty() {
                break;
            }
        }
        self.closed_flag.store(true, Ordering::Release);
    }

    async fn drain_frames(&mut self) -> ClientResult<()> {
        loop {
            match crate::resp::decode(&mut self.read_buf) {
                Ok(Some(token)) => self.dispatch_token(token).await?,
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.fail_all_pending(ClientError::Protocol(err));
                    self.begin_closing();
                    return Ok(());
                }
            }
        }
    }

    async fn handle_send(&mut self, req: SendRequest, reply_tx: oneshot::Sender<ClientResult<RespToken>>) {
        if self.closing {
            let _ = reply_tx.send(Err(ClientError::Transport(TransportError::ConnectionClosed)));
            return;
        }
        if let Err(err) = self.stream.write_all(&req.payload).await {
            let _ = reply_tx.send(Err(TransportError::from(err).into()));
            self.begin_closing();
            return;
        }
        let id = next_request_id();
        let deadline = req.timeout.map(|d| Instant::now() + d);
        if let Some(at) = deadline {
            self.deadlines.push(Reverse((at, id)));
        }
        self.pending.push_back(FifoEntry {
            entry: PendingEntry { id, reply_tx: Some(reply_tx), deadline, kind: req.kind },
            acks_remaining: 0,
        });
    }

    async fn handle_subscribe_add(
        &mut self,
        req: SubscribeRequest,
        reply_tx: oneshot::Sender<ClientResult<()>>,
    ) {
        if self.closing {
            let _ = reply_tx.send(Err(ClientError::Transport(TransportError::ConnectionClosed)));
            return;
        }
        self.subscribers.insert(req.subscriber_id, req.msg_tx);

        let mut fresh = Vec::new();
        for filter in &req.filters {
            match self.filters.get_mut(filter) {
                Some(existing) => existing.attach(req.subscriber_id),
                None => {
                    self.filters.insert(filter.clone(), FilterEntry::opening(req.subscriber_id));
                    fresh.push(filter.clone());
                }
            }
        }

        if fresh.is_empty() {
            let _ = reply_tx.send(Ok(()));
            return;
        }

        let command_name = fresh[0].subscribe_command_name();
        let args: Vec<&[u8]> = fresh.iter().map(|f| f.wire_name().as_ref()).collect();
        let payload = encode_command(command_name, &args);
        if let Err(err) = self.stream.write_all(&payload).await {
            let _ = reply_tx.send(Err(TransportError::from(err).into()));
            self.begin_closing();
            return;
        }
        let id = next_request_id();
        self.pending.push_back(FifoEntry {
            entry: PendingEntry {
                id,
                reply_tx: None,
                deadline: None,
                kind: CommandKind::Subscribe(fresh.clone()),
            },
            acks_remaining: fresh.len(),
        });
        self.subscribe_acks.insert(id, reply_tx);
    }

    async fn handle_subscribe_remove(&mut self, req: UnsubscribeRequest) {
        let mut to_unsubscribe = Vec::new();
        for filter in &req.filters {
            if let Some(entry) = self.filters.get_mut(filter) {
                if entry.detach(req.subscriber_id) {
                    to_unsubscribe.push(filter.clone());
                }
            }
        }
        self.subscribers.remove(&req.subscriber_id);
        if to_unsubscribe.is_empty() || self.closing {
            return;
        }
        let command_name = to_unsubscribe[0].unsubscribe_command_name();
        let args: Vec<&[u8]> = to_unsubscribe.iter().map(|f| f.wire_name().as_ref()).collect();
        let payload = encode_command(command_name, &args);
        if self.stream.write_all(&payload).await.is_err() {
            self.begin_closing();
            return;
        }
        let id = next_request_id();
        self.pending.push_back(FifoEntry {
            entry: PendingEntry {
                id,
                reply_tx: None,
                deadline: None,
                kind: CommandKind::Unsubscribe(to_unsubscribe.clone()),
            },
            acks_remaining: to_unsubscribe.len(),
        });
    }

    async fn dispatch_token(&mut self, token: RespToken) -> ClientResult<()> {
        if token.is_push() {
            self.handle_push(token).await
        } else {
            self.resolve_head(token);
            Ok(())
        }
    }

    fn resolve_head(&mut self, token: RespToken) {
        // A stale deadline for this id may still sit in the heap; when it
        // eventually surfaces, `handle_timeout` finds no matching pending
        // entry and simply discards it.
        if let Some(head) = self.pending.pop_front() {
            let result = match classify_reply(&token) {
                Some(server_err) => Err(ClientError::Server(server_err)),
                None => Ok(token),
            };
            self.complete_head(head, result);
        }
    }

    /// Resolves a popped FIFO entry. A subscribe command's `PendingEntry`
    /// has no `reply_tx` of its own — it normally completes via push acks
    /// tracked in `subscribe_acks` (`account_ack`) — so an error reply
    /// landing on it here (e.g. `-ERR wrong number of arguments` instead
    /// of the expected acks) would otherwise resolve nothing and leave the
    /// caller's `subscribe()` waiting forever, with the filters it opened
    /// stuck in the table. Clear both out whenever the head errors.
    fn complete_head(&mut self, mut head: FifoEntry, result: ClientResult<RespToken>) {
        if let (CommandKind::Subscribe(filters), Err(err)) = (&head.entry.kind, &result) {
            for filter in filters {
                self.filters.remove(filter);
            }
            if let Some(reply_tx) = self.subscribe_acks.remove(&head.entry.id) {
                let _ = reply_tx.send(Err(clone_client_error(err)));
            }
        }
        head.entry.resolve(result);
    }

    async fn handle_push(&mut self, token: crate::resp::RespToken) -> ClientResult<()> {
        let elements = match &token {
            RespToken::Push(agg) => agg.elements()?,
            _ => return Ok(()),
        };
        let Some(kind_token) = elements.first() else { return Ok(()) };
        let Some(kind_bytes) = kind_token.as_bytes() else { return Ok(()) };
        let kind = kind_bytes.to_vec();

        match kind.as_slice() {
            b"message" => self.deliver_message(&elements, MessageShape::Channel),
            b"pmessage" => self.deliver_message(&elements, MessageShape::Pattern),
            b"smessage" => self.deliver_message(&elements, MessageShape::ShardChannel),
            b"subscribe" | b"psubscribe" | b"ssubscribe" => self.ack_subscribe(&elements).await,
            b"unsubscribe" | b"punsubscribe" | b"sunsubscribe" => self.ack_unsubscribe(&elements),
            _ => {}
        }
        Ok(())
    }

    fn deliver_message(&mut self, elements: &[RespToken], shape: MessageShape) {
        let (filter, channel, message, pattern) = match shape {
            MessageShape::Channel | MessageShape::ShardChannel => {
                let Some(channel) = elements.get(1).and_then(|t| t.as_bytes()) else { return };
                let Some(message) = elements.get(2).and_then(|t| t.as_bytes()) else { return };
                let filter = if matches!(shape, MessageShape::ShardChannel) {
                    SubscriptionFilter::ShardChannel(channel.clone())
                } else {
                    SubscriptionFilter::Channel(channel.clone())
                };
                (filter, channel.clone(), message.clone(), None)
            }
            MessageShape::Pattern => {
                let Some(pattern) = elements.get(1).and_then(|t| t.as_bytes()) else { return };
                let Some(channel) = elements.get(2).and_then(|t| t.as_bytes()) else { return };
                let Some(message) = elements.get(3).and_then(|t| t.as_bytes()) else { return };
                (
                    SubscriptionFilter::Pattern(pattern.clone()),
                    channel.clone(),
                    message.clone(),
                    Some(pattern.clone()),
                )
            }
        };
        let Some(entry) = self.filters.get(&filter) else { return };
        if entry.state != FilterState::Active {
            return;
        }
        for (id, tx) in &self.subscribers {
            if entry.contains(*id) {
                let _ = tx.send(SubscriptionMessage { channel: channel.clone(), message: message.clone(), pattern: pattern.clone() });
            }
        }
    }

    async fn ack_subscribe(&mut self, elements: &[RespToken]) {
        let Some(channel) = elements.get(1).and_then(|t| t.as_bytes()).cloned() else { return };
        let filter = find_filter_by_name(&self.filters, &channel);
        let Some(filter) = filter else { return };
        let downgraded = self.filters.get_mut(&filter).map(|e| e.mark_active()).unwrap_or(false);
        self.account_ack(&filter);
        if downgraded {
            self.emit_deferred_unsubscribe(filter).await;
        }
    }

    fn ack_unsubscribe(&mut self, elements: &[RespToken]) {
        let Some(channel) = elements.get(1).and_then(|t| t.as_bytes()).cloned() else { return };
        let filter = find_filter_by_name(&self.filters, &channel);
        let Some(filter) = filter else { return };
        self.filters.remove(&filter);
        self.account_ack(&filter);
    }

    fn account_ack(&mut self, filter: &SubscriptionFilter) {
        let Some(head) = self.pending.front_mut() else { return };
        let matches_head = match &head.entry.kind {
            CommandKind::Subscribe(filters) | CommandKind::Unsubscribe(filters) => filters.contains(filter),
            _ => false,
        };
        if !matches_head || head.acks_remaining == 0 {
            return;
        }
        head.acks_remaining -= 1;
        if head.acks_remaining == 0 {
            let mut completed = self.pending.pop_front().expect("front_mut just matched");
            completed.entry.resolve(Ok(RespToken::Null));
            if let Some(reply_tx) = self.subscribe_acks.remove(&completed.entry.id) {
                let _ = reply_tx.send(Ok(()));
            }
        }
    }

    /// A filter emptied out while still opening: its subscribe ack just
    /// arrived, downgrading it straight to `Closing` with no subscriber
    /// left to notify. Emits the wire-level unsubscribe now (mirroring
    /// `handle_subscribe_remove`) instead of leaving the entry stranded in
    /// the table, which would otherwise wedge any later subscriber that
    /// names the same filter (`handle_subscribe_add` would attach onto a
    /// dead entry that can never become `Active`).
    async fn emit_deferred_unsubscribe(&mut self, filter: SubscriptionFilter) {
        self.filters.remove(&filter);
        if self.closing {
            return;
        }
        let command_name = filter.unsubscribe_command_name();
        let payload = encode_command(command_name, &[filter.wire_name().as_ref()]);
        if self.stream.write_all(&payload).await.is_err() {
            self.begin_closing();
            return;
        }
        self.pending.push_back(FifoEntry {
            entry: PendingEntry {
                id: next_request_id(),
                reply_tx: None,
                deadline: None,
                kind: CommandKind::Unsubscribe(vec![filter]),
            },
            acks_remaining: 1,
        });
    }

    fn begin_closing(&mut self) {
        if self.closing {
            return;
        }
        tracing::debug!(pending = self.pending.len(), "connection closing");
        self.closing = true;
        self.fail_all_pending(ClientError::Transport(TransportError::ConnectionClosed));
    }

    fn fail_all_pending(&mut self, err_factory: ClientError) {
        while let Some(entry) = self.pending.pop_front() {
            let err = clone_client_error(&err_factory);
            self.complete_head(entry, Err(err));
        }
        self.deadlines.clear();
    }

    fn handle_timeout(&mut self) {
        let Some(Reverse((at, id))) = self.deadlines.peek().copied() else { return };
        if Instant::now() < at {
            return;
        }
        self.deadlines.pop();
        if let Some(pos) = self.pending.iter().position(|e| e.entry.id == id) {
            let entry = self.pending.remove(pos).expect("position just found");
            let timeout_err = if entry.entry.kind.is_blocking() {
                TimingError::BlockingCommandTimeout
            } else {
                TimingError::CommandTimeout
            };
            tracing::warn!(request_id = id, blocking = entry.entry.kind.is_blocking(), "command timed out");
            self.complete_head(entry, Err(ClientError::Timing(timeout_err)));
            // The wire is no longer synchronizable: the server may still
            // send the delayed reply for this command (§4.3).
            self.begin_closing();
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MessageShape {
    Channel,
    ShardChannel,
    Pattern,
}

fn find_filter_by_name(
    filters: &HashMap<SubscriptionFilter, FilterEntry>,
    name: &bytes::Bytes,
) -> Option<SubscriptionFilter> {
    filters.keys().find(|f| f.wire_name() == name).cloned()
}

/// Recognizes the redirect/error prefixes the core must surface as typed
/// server errors (§6, §7). Returns `None` for an ordinary (non-error)
/// reply.
pub(crate) fn classify_reply(token: &RespToken) -> Option<ServerError> {
    let bytes = match token {
        RespToken::SimpleError(b) | RespToken::BulkError(b) => b,
        _ => return None,
    };
    let text = String::from_utf8_lossy(bytes);
    let mut parts = text.split_whitespace();
    let kind = match parts.next()? {
        "MOVED" => {
            let slot: u16 = parts.next()?.parse().ok()?;
            let addr = parts.next()?.to_string();
            ServerErrorKind::Moved { slot, addr }
        }
        "ASK" => {
            let slot: u16 = parts.next()?.parse().ok()?;
            let addr = parts.next()?.to_string();
            ServerErrorKind::Ask { slot, addr }
        }
        "TRYAGAIN" => ServerErrorKind::TryAgain,
        "CROSSSLOT" => ServerErrorKind::CrossSlot,
        "CLUSTERDOWN" => ServerErrorKind::ClusterDown,
        "LOADING" => ServerErrorKind::Loading,
        "READONLY" => ServerErrorKind::ReadOnly,
        "NOAUTH" => ServerErrorKind::NoAuth,
        "WRONGPASS" => ServerErrorKind::WrongPass,
        _ => ServerErrorKind::Generic,
    };
    Some(ServerError::new(kind, bytes.clone()))
}

fn clone_client_error(err: &ClientError) -> ClientError {
    match err {
        ClientError::Transport(TransportError::ConnectionClosed) => {
            ClientError::Transport(TransportError::ConnectionClosed)
        }
        ClientError::Protocol(p) => ClientError::Protocol(p.clone()),
        _ => ClientError::Transport(TransportError::ConnectionClosed),
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Spawns a connection actor over an already-handshaken stream.
pub fn spawn<S>(stream: S) -> ConnectionHandle
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let actor = ConnectionActor {
        stream,
        read_buf: BytesMut::with_capacity(16 * 1024),
        pending: VecDeque::new(),
        deadlines: BinaryHeap::new(),
        filters: HashMap::new(),
        subscribers: HashMap::new(),
        subscribe_acks: HashMap::new(),
        closing: false,
        closed_flag: closed.clone(),
    };
    tokio::spawn(actor.run(rx));
    ConnectionHandle { id, tx, closed }
}
