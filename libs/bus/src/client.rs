//! Connection management, subscriptions and publish acknowledgements.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::options::ConnectOptions;
use crate::protocol::{self, Message, Parser, ServerOp};

/// Callback invoked for every message delivered to a subscription.
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback invoked when the client raises an error.
pub type ErrorCallback = Arc<dyn Fn(&BusError) + Send + Sync>;

type PongCallback = Box<dyn FnOnce() + Send>;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Open,
    Reconnecting,
    Closing,
    Closed,
}

/// Options for a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group; the broker delivers each message to one member.
    pub queue: Option<String>,
    /// Unsubscribe automatically after this many messages.
    pub max_messages: Option<u64>,
}

struct Subscription {
    subject: String,
    queue: Option<String>,
    callback: MessageCallback,
    received: u64,
    max: Option<u64>,
}

struct State {
    /// Incremented for every established connection; tasks of older
    /// connections compare against it before acting.
    generation: u64,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    reader: Option<AbortHandle>,
    /// Publishes issued while no connection was open.
    pending: Vec<Bytes>,
    subscriptions: BTreeMap<u64, Subscription>,
    /// One entry per outstanding PING on the current connection.
    pongs: VecDeque<Option<PongCallback>>,
    next_sid: u64,
}

struct Shared {
    options: ConnectOptions,
    state: Mutex<State>,
    status: watch::Sender<Status>,
    on_error: Mutex<Option<ErrorCallback>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> Status {
        *self.status.borrow()
    }

    fn set_status(&self, status: Status) {
        self.status.send_replace(status);
    }
}

/// Bus client handle. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.shared.options.host)
            .field("port", &self.shared.options.port)
            .field("status", &self.status())
            .finish()
    }
}

impl Client {
    /// Creates a client without connecting. Publishes made before
    /// [`Client::connect`] are buffered.
    pub fn new(options: ConnectOptions) -> Self {
        let (status, _) = watch::channel(Status::Connecting);
        Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(State {
                    generation: 0,
                    writer: None,
                    reader: None,
                    pending: Vec::new(),
                    subscriptions: BTreeMap::new(),
                    pongs: VecDeque::new(),
                    next_sid: 1,
                }),
                status,
                on_error: Mutex::new(None),
            }),
        }
    }

    /// Creates a client and connects it.
    pub async fn connect_to(options: ConnectOptions) -> Result<Self, BusError> {
        let client = Self::new(options);
        client.connect().await?;
        Ok(client)
    }

    /// Opens the connection and performs the handshake.
    pub async fn connect(&self) -> Result<(), BusError> {
        establish(&self.shared).await
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.shared.status.subscribe()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.shared.options
    }

    /// Installs the error handler. Without one, broker errors close the
    /// connection.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&BusError) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Publishes a message. Empty subjects are ignored.
    pub fn publish(&self, subject: &str, payload: &[u8], reply: Option<&str>) {
        if subject.is_empty() {
            return;
        }
        let command = protocol::publish(subject, reply, payload);
        let mut state = self.shared.state();
        send_or_queue(&mut state, command);
    }

    /// Publishes a message; `callback` runs once the broker has processed it,
    /// i.e. after the PING that follows it is answered. Callbacks fire in the
    /// order they were queued.
    pub fn publish_with_callback<F>(
        &self,
        subject: &str,
        payload: &[u8],
        reply: Option<&str>,
        callback: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        if subject.is_empty() {
            return;
        }
        let command = protocol::publish(subject, reply, payload);
        let mut state = self.shared.state();
        send_or_queue(&mut state, command);
        queue_ping(&mut state, Some(Box::new(callback)));
    }

    /// Runs `callback` after a full round trip to the broker.
    pub fn flush<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state();
        queue_ping(&mut state, Some(Box::new(callback)));
    }

    /// Subscribes to `subject`, returning the subscription id.
    pub fn subscribe<F>(&self, subject: &str, options: SubscribeOptions, callback: F) -> u64
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let mut state = self.shared.state();
        let sid = state.next_sid;
        state.next_sid += 1;

        send_if_open(
            &state,
            protocol::subscribe(subject, options.queue.as_deref(), sid),
        );
        state.subscriptions.insert(
            sid,
            Subscription {
                subject: subject.to_string(),
                queue: options.queue,
                callback: Arc::new(callback),
                received: 0,
                max: None,
            },
        );

        if let Some(max) = options.max_messages.filter(|max| *max > 0) {
            unsubscribe_locked(&self.shared, &mut state, sid, Some(max));
        }

        debug!(subject, sid, "Subscribed");
        sid
    }

    /// Removes a subscription, immediately or after `max` total messages.
    ///
    /// Unknown or already removed ids are ignored unless the connection is
    /// pedantic, in which case the broker is asked anyway and reports the
    /// misuse through the error handler.
    pub fn unsubscribe(&self, sid: u64, max: Option<u64>) {
        let mut state = self.shared.state();
        unsubscribe_locked(&self.shared, &mut state, sid, max);
    }

    /// Sends a request with a fresh inbox as reply subject. Replies are
    /// delivered to `callback`. Returns the inbox subscription id.
    pub fn request<F>(&self, subject: &str, payload: &[u8], callback: F) -> u64
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let inbox = new_inbox();
        let sid = self.subscribe(&inbox, SubscribeOptions::default(), callback);
        self.publish(subject, payload, Some(&inbox));
        sid
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.state().subscriptions.len()
    }

    /// Closes the connection. Buffered writes already handed to the writer
    /// are flushed; pending publish callbacks are dropped.
    pub fn close(&self) {
        close(&self.shared);
    }
}

/// Generates a unique reply subject.
pub fn new_inbox() -> String {
    let bytes: [u8; 12] = rand::rng().random();
    format!("_INBOX.{}", hex::encode(bytes))
}

// =============================================================================
// Command Routing
// =============================================================================

fn send_if_open(state: &State, command: Bytes) -> bool {
    match &state.writer {
        Some(writer) => writer.send(command).is_ok(),
        None => false,
    }
}

fn send_or_queue(state: &mut State, command: Bytes) {
    if let Some(writer) = &state.writer {
        match writer.send(command) {
            Ok(()) => return,
            Err(mpsc::error::SendError(command)) => state.pending.push(command),
        }
    } else {
        state.pending.push(command);
    }
}

fn queue_ping(state: &mut State, callback: Option<PongCallback>) {
    // Without a connection the PING is issued during the next handshake.
    send_if_open(state, Bytes::from_static(protocol::PING));
    state.pongs.push_back(callback);
}

fn unsubscribe_locked(shared: &Shared, state: &mut State, sid: u64, max: Option<u64>) {
    let max = max.filter(|m| *m > 0);

    let Some(sub) = state.subscriptions.get_mut(&sid) else {
        if shared.options.pedantic {
            send_if_open(state, protocol::unsubscribe(sid, max));
        }
        return;
    };

    match max {
        Some(max) if sub.received < max => sub.max = Some(max),
        _ => {
            state.subscriptions.remove(&sid);
        }
    }
    send_if_open(state, protocol::unsubscribe(sid, max));
}

// =============================================================================
// Connection Lifecycle
// =============================================================================

async fn establish(shared: &Arc<Shared>) -> Result<(), BusError> {
    let options = &shared.options;
    let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();

    let connect = protocol::connect(&options.connect_info())?;
    let (tx, rx) = mpsc::unbounded_channel();

    let generation = {
        let mut state = shared.state();
        if matches!(shared.status(), Status::Closing | Status::Closed) {
            return Err(BusError::Closed);
        }

        state.generation += 1;

        // Handshake first, then live subscriptions, buffered publishes and
        // one PING per callback still waiting for its PONG.
        let _ = tx.send(connect);
        for (sid, sub) in &state.subscriptions {
            let _ = tx.send(protocol::subscribe(&sub.subject, sub.queue.as_deref(), *sid));
            if let Some(max) = sub.max {
                let _ = tx.send(protocol::unsubscribe(*sid, Some(max - sub.received)));
            }
        }
        for command in state.pending.drain(..) {
            let _ = tx.send(command);
        }
        for _ in 0..state.pongs.len() {
            let _ = tx.send(Bytes::from_static(protocol::PING));
        }

        state.writer = Some(tx);
        shared.set_status(Status::Open);
        state.generation
    };

    tokio::spawn(write_loop(Arc::clone(shared), generation, write_half, rx));
    let reader = tokio::spawn(read_loop(Arc::clone(shared), generation, read_half));

    {
        let mut state = shared.state();
        if state.generation == generation {
            state.reader = Some(reader.abort_handle());
        } else {
            reader.abort();
        }
    }

    info!(
        host = %options.host,
        port = options.port,
        generation,
        "Connected to message bus"
    );
    Ok(())
}

async fn write_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(command) = rx.recv().await {
        if let Err(e) = writer.write_all(&command).await {
            warn!(error = %e, "Bus write failed");
            connection_lost(&shared, generation);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(shared: Arc<Shared>, generation: u64, mut reader: OwnedReadHalf) {
    let mut parser = Parser::new();

    loop {
        parser.buffer_mut().reserve(8 * 1024);
        match reader.read_buf(parser.buffer_mut()).await {
            Ok(0) => {
                warn!("Bus connection closed by server");
                connection_lost(&shared, generation);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Bus read failed");
                connection_lost(&shared, generation);
                return;
            }
        }

        loop {
            match parser.next_op() {
                Ok(Some(op)) => handle_op(&shared, op),
                Ok(None) => break,
                Err(e) => {
                    raise_error(&shared, BusError::Protocol(e));
                    connection_lost(&shared, generation);
                    return;
                }
            }
        }
    }
}

fn handle_op(shared: &Arc<Shared>, op: ServerOp) {
    match op {
        ServerOp::Msg(message) => deliver(shared, message),
        ServerOp::Ping => {
            send_if_open(&shared.state(), Bytes::from_static(protocol::PONG));
        }
        ServerOp::Pong => {
            let callback = shared.state().pongs.pop_front().flatten();
            if let Some(callback) = callback {
                callback();
            }
        }
        ServerOp::Ok => {}
        ServerOp::Info(info) => debug!(info = %info, "Bus server info"),
        ServerOp::Err(message) => raise_error(shared, BusError::Server(message)),
        ServerOp::Unknown(line) => raise_error(shared, BusError::UnknownProtocol(line)),
    }
}

fn deliver(shared: &Shared, message: Message) {
    let callback = {
        let mut state = shared.state();
        let Some(sub) = state.subscriptions.get_mut(&message.sid) else {
            return;
        };

        sub.received += 1;
        let callback = Arc::clone(&sub.callback);
        match sub.max {
            Some(max) if sub.received > max => {
                state.subscriptions.remove(&message.sid);
                return;
            }
            Some(max) if sub.received == max => {
                state.subscriptions.remove(&message.sid);
            }
            _ => {}
        }
        callback
    };

    callback(message);
}

fn raise_error(shared: &Shared, err: BusError) {
    let handler = shared
        .on_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    match handler {
        Some(handler) => handler(&err),
        None => {
            error!(error = %err, "Unhandled bus error, closing connection");
            close(shared);
        }
    }
}

fn connection_lost(shared: &Arc<Shared>, generation: u64) {
    {
        let mut state = shared.state();
        if state.generation != generation
            || matches!(
                shared.status(),
                Status::Reconnecting | Status::Closing | Status::Closed
            )
        {
            return;
        }

        state.writer = None;
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        shared.set_status(Status::Reconnecting);
    }

    tokio::spawn(reconnect(Arc::clone(shared)));
}

async fn reconnect(shared: Arc<Shared>) {
    let attempts = shared.options.reconnect_attempts;

    for attempt in 1..=attempts {
        if shared.status() != Status::Reconnecting {
            return;
        }

        match establish(&shared).await {
            Ok(()) => {
                info!(attempt, "Reconnected to message bus");
                return;
            }
            Err(BusError::Closed) => return,
            Err(e) => warn!(attempt, error = %e, "Bus reconnect attempt failed"),
        }

        if attempt < attempts {
            tokio::time::sleep(shared.options.reconnect_delay).await;
        }
    }

    if shared.status() == Status::Reconnecting {
        shared.set_status(Status::Closed);
        shared.state().pending.clear();
        raise_error(&shared, BusError::ReconnectExhausted { attempts });
    }
}

fn close(shared: &Shared) {
    let mut state = shared.state();
    if shared.status() == Status::Closed && state.writer.is_none() {
        return;
    }

    shared.set_status(Status::Closing);
    state.writer = None;
    if let Some(reader) = state.reader.take() {
        reader.abort();
    }
    state.pongs.clear();
    shared.set_status(Status::Closed);
    debug!("Bus connection closed");
}
