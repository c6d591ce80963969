use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use lime_envelope::{
    Command, Envelope, Event, Message, Node, Notification, Session, SessionState,
};
use lime_transport::Transport;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ChannelError, Result};
use crate::information::ChannelInformation;
use crate::module::{ChannelModule, ChannelModules};
use crate::state::{check_receive, check_send, ChannelRole};

/// Default capacity of each per-kind receive queue.
pub const DEFAULT_ENVELOPE_BUFFER_SIZE: usize = 64;

/// Default upper bound for a single send: 30 seconds.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel behaviour settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Capacity of each per-kind receive queue.
    pub envelope_buffer_size: usize,
    /// Answer ping commands without delivering them.
    pub auto_reply_pings: bool,
    /// Send a `received` notification for every message that carries an id.
    pub auto_notify_receipt: bool,
    /// Upper bound for every send.
    pub send_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            envelope_buffer_size: DEFAULT_ENVELOPE_BUFFER_SIZE,
            auto_reply_pings: true,
            auto_notify_receipt: false,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

struct SessionInfo {
    id: Option<String>,
    state: SessionState,
    local_node: Option<Node>,
    remote_node: Option<Node>,
}

struct Senders {
    message: mpsc::Sender<Message>,
    notification: mpsc::Sender<Notification>,
    command: mpsc::Sender<Command>,
    session: mpsc::Sender<Session>,
}

struct Receivers {
    message: Mutex<mpsc::Receiver<Message>>,
    notification: Mutex<mpsc::Receiver<Notification>>,
    command: Mutex<mpsc::Receiver<Command>>,
    session: Mutex<mpsc::Receiver<Session>>,
}

fn queues(capacity: usize) -> (Senders, Receivers) {
    let capacity = capacity.max(1);
    let (message_tx, message_rx) = mpsc::channel(capacity);
    let (notification_tx, notification_rx) = mpsc::channel(capacity);
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (session_tx, session_rx) = mpsc::channel(capacity);
    (
        Senders {
            message: message_tx,
            notification: notification_tx,
            command: command_tx,
            session: session_tx,
        },
        Receivers {
            message: Mutex::new(message_rx),
            notification: Mutex::new(notification_rx),
            command: Mutex::new(command_rx),
            session: Mutex::new(session_rx),
        },
    )
}

struct ChannelInner {
    transport: Arc<dyn Transport>,
    role: ChannelRole,
    config: ChannelConfig,
    session: StdMutex<SessionInfo>,
    modules: ChannelModules,
    receivers: Receivers,
    senders: StdMutex<Option<Senders>>,
    pending_commands: StdMutex<HashMap<String, oneshot::Sender<Command>>>,
    failure: StdMutex<Option<ChannelError>>,
    listening: AtomicBool,
    stopped: AtomicBool,
    stop: CancellationToken,
}

/// A session over one transport.
///
/// Every send is checked against the session state and the channel role.
/// Before the session is established, sessions are read straight from the
/// transport. Once it is established, a background loop reads the transport
/// and routes each envelope to a per-kind queue, answering pings and sending
/// delivery receipts on the way. A channel is single-use: after the session
/// ends it must be dropped.
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(transport: Arc<dyn Transport>, role: ChannelRole, config: ChannelConfig) -> Self {
        let (senders, receivers) = queues(config.envelope_buffer_size);
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                role,
                config,
                session: StdMutex::new(SessionInfo {
                    id: None,
                    state: SessionState::New,
                    local_node: None,
                    remote_node: None,
                }),
                modules: ChannelModules::new(),
                receivers,
                senders: StdMutex::new(Some(senders)),
                pending_commands: StdMutex::new(HashMap::new()),
                failure: StdMutex::new(None),
                listening: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// A client channel with the default configuration.
    pub fn client(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, ChannelRole::Client, ChannelConfig::default())
    }

    /// A server channel with the default configuration.
    pub fn server(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, ChannelRole::Server, ChannelConfig::default())
    }

    pub fn role(&self) -> ChannelRole {
        self.inner.role
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session().id.clone()
    }

    pub fn local_node(&self) -> Option<Node> {
        self.inner.session().local_node.clone()
    }

    pub fn remote_node(&self) -> Option<Node> {
        self.inner.session().remote_node.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// True while the session is established over a live transport and
    /// inbound envelopes are still being routed.
    pub fn is_usable(&self) -> bool {
        self.state() == SessionState::Established
            && self.is_connected()
            && !self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn information(&self) -> ChannelInformation {
        let session = self.inner.session();
        ChannelInformation {
            session_id: session.id.clone(),
            state: session.state,
            local_node: session.local_node.clone(),
            remote_node: session.remote_node.clone(),
            is_connected: self.inner.transport.is_connected(),
        }
    }

    pub fn add_message_module(&self, module: Arc<dyn ChannelModule<Message>>) {
        self.inner.modules.message.add(module);
    }

    pub fn add_notification_module(&self, module: Arc<dyn ChannelModule<Notification>>) {
        self.inner.modules.notification.add(module);
    }

    pub fn add_command_module(&self, module: Arc<dyn ChannelModule<Command>>) {
        self.inner.modules.command.add(module);
    }

    pub async fn send_message(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.inner.send_envelope(message.into(), cancel).await
    }

    pub async fn send_notification(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.send_envelope(notification.into(), cancel).await
    }

    pub async fn send_command(&self, command: Command, cancel: &CancellationToken) -> Result<()> {
        self.inner.send_envelope(command.into(), cancel).await
    }

    /// Send a session envelope; the channel moves to its declared state.
    pub async fn send_session(&self, session: Session, cancel: &CancellationToken) -> Result<()> {
        self.inner.send_envelope(session.into(), cancel).await
    }

    pub async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message> {
        check_receive("receive a message", self.state())?;
        self.inner.dequeue(&self.inner.receivers.message, cancel).await
    }

    pub async fn receive_notification(&self, cancel: &CancellationToken) -> Result<Notification> {
        check_receive("receive a notification", self.state())?;
        self.inner
            .dequeue(&self.inner.receivers.notification, cancel)
            .await
    }

    /// Receive the next command that is not a ping and not a response to
    /// [`Channel::process_command`].
    pub async fn receive_command(&self, cancel: &CancellationToken) -> Result<Command> {
        check_receive("receive a command", self.state())?;
        self.inner.dequeue(&self.inner.receivers.command, cancel).await
    }

    /// Receive the next session envelope. Allowed in every state.
    pub async fn receive_session(&self, cancel: &CancellationToken) -> Result<Session> {
        if self.inner.listening.load(Ordering::Acquire) {
            return self.inner.dequeue(&self.inner.receivers.session, cancel).await;
        }
        match self.inner.transport.receive(cancel).await? {
            Envelope::Session(session) => {
                self.inner.session_received(&session).await;
                Ok(session)
            }
            other => Err(ChannelError::UnexpectedEnvelope(other.kind())),
        }
    }

    /// Send a pending command and wait for the response with the same id.
    pub async fn process_command(
        &self,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<Command> {
        let id = command
            .id()
            .map(str::to_owned)
            .ok_or_else(|| ChannelError::InvalidArgument("command id must not be empty".into()))?;
        if !command.status.is_pending() {
            return Err(ChannelError::InvalidArgument(
                "only pending commands can be processed".into(),
            ));
        }
        check_send(self.inner.role, self.state(), &Envelope::Command(command.clone()))?;

        let (waiter, reply) = oneshot::channel();
        {
            let mut pending = self.inner.pending();
            if pending.contains_key(&id) {
                return Err(ChannelError::InvalidArgument(format!(
                    "a command with id '{id}' is already being processed"
                )));
            }
            pending.insert(id.clone(), waiter);
        }
        if self.inner.stopped.load(Ordering::SeqCst) {
            self.inner.pending().remove(&id);
            return Err(self.inner.closed_error());
        }

        if let Err(err) = self.inner.send_envelope(command.into(), cancel).await {
            self.inner.pending().remove(&id);
            return Err(err);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.inner.pending().remove(&id);
                Err(ChannelError::Cancelled)
            }
            response = reply => response.map_err(|_| self.inner.closed_error()),
        }
    }

    /// Stop receiving and close the transport.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.stop.cancel();
        self.inner.transport.close(cancel).await?;
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.inner.session();
        f.debug_struct("Channel")
            .field("role", &self.inner.role)
            .field("session_id", &session.id)
            .field("state", &session.state)
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    fn session(&self) -> StdMutexGuard<'_, SessionInfo> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> StdMutexGuard<'_, HashMap<String, oneshot::Sender<Command>>> {
        self.pending_commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        self.session().state
    }

    fn closed_error(&self) -> ChannelError {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(ChannelError::Closed)
    }

    async fn send_envelope(
        self: &Arc<Self>,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_send(self.role, self.state(), &envelope)?;

        let envelope = match envelope {
            Envelope::Message(message) => self
                .modules
                .message
                .sending(message, cancel)
                .await
                .map(Envelope::Message),
            Envelope::Notification(notification) => self
                .modules
                .notification
                .sending(notification, cancel)
                .await
                .map(Envelope::Notification),
            Envelope::Command(command) => self
                .modules
                .command
                .sending(command, cancel)
                .await
                .map(Envelope::Command),
            Envelope::Session(mut session) => {
                self.stamp_session_id(&mut session);
                Some(Envelope::Session(session))
            }
        };
        let Some(envelope) = envelope else {
            trace!(role = ?self.role, "outbound envelope dropped by module");
            return Ok(());
        };

        let timeout = self.config.send_timeout;
        match tokio::time::timeout(timeout, self.transport.send(&envelope, cancel)).await {
            Ok(result) => result?,
            Err(_) => return Err(ChannelError::Timeout(timeout)),
        }

        if let Envelope::Session(session) = &envelope {
            self.record_nodes(session, true);
            self.set_state(session.state).await;
        }
        Ok(())
    }

    fn stamp_session_id(&self, session: &mut Session) {
        if session.header.id().is_some() {
            return;
        }
        if let Some(id) = self.session().id.clone() {
            session.header.id = Some(id);
        }
    }

    /// Update the session id and peer nodes from a session envelope.
    fn record_nodes(&self, session: &Session, outbound: bool) {
        let mut info = self.session();
        if info.id.is_none() {
            info.id = session.header.id().map(str::to_owned);
        }
        if session.state != SessionState::Established {
            return;
        }
        let (local, remote) = if outbound {
            (&session.header.from, &session.header.to)
        } else {
            (&session.header.to, &session.header.from)
        };
        if local.is_some() {
            info.local_node = local.clone();
        }
        if remote.is_some() {
            info.remote_node = remote.clone();
        }
    }

    async fn session_received(self: &Arc<Self>, session: &Session) {
        if self.role == ChannelRole::Server && session.state == SessionState::New {
            let mut info = self.session();
            if info.id.is_none() {
                info.id = Some(uuid::Uuid::new_v4().to_string());
            }
        }
        self.record_nodes(session, false);
        self.set_state(session.state).await;
    }

    async fn set_state(self: &Arc<Self>, state: SessionState) {
        let previous = std::mem::replace(&mut self.session().state, state);
        if previous == state {
            return;
        }
        debug!(role = ?self.role, %previous, %state, "session state changed");
        self.modules.state_changed(previous, state).await;
        if state == SessionState::Established {
            self.start_listening();
        }
    }

    fn start_listening(self: &Arc<Self>) {
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(senders) = senders else {
            return;
        };
        self.listening.store(true, Ordering::Release);
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.receive_loop(senders).await });
    }

    async fn receive_loop(self: Arc<Self>, senders: Senders) {
        debug!(role = ?self.role, "channel receive loop started");
        let result = loop {
            let envelope = match self.transport.receive(&self.stop).await {
                Ok(envelope) => envelope,
                Err(err) if err.is_cancelled() => break Ok(()),
                Err(err) => break Err(ChannelError::from(err)),
            };
            match self.route(envelope, &senders).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.stopped.store(true, Ordering::SeqCst);
        match result {
            Ok(()) => debug!(role = ?self.role, "channel receive loop stopped"),
            Err(err) => {
                warn!(role = ?self.role, error = %err, "channel receive loop failed; closing transport");
                *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                // Nothing reads the transport anymore.
                if let Err(err) = self.transport.close(&CancellationToken::new()).await {
                    debug!(role = ?self.role, error = %err, "closing transport failed");
                }
            }
        }
        self.pending().clear();
    }

    /// Deliver one inbound envelope. Returns `false` once the session ended.
    async fn route(self: &Arc<Self>, envelope: Envelope, senders: &Senders) -> Result<bool> {
        let stop = &self.stop;
        match envelope {
            Envelope::Message(message) => {
                let Some(message) = self.modules.message.receiving(message, stop).await else {
                    return Ok(true);
                };
                if self.config.auto_notify_receipt {
                    self.notify_receipt(&message).await;
                }
                Ok(deliver(&senders.message, message, stop).await)
            }
            Envelope::Notification(notification) => {
                let Some(notification) = self
                    .modules
                    .notification
                    .receiving(notification, stop)
                    .await
                else {
                    return Ok(true);
                };
                Ok(deliver(&senders.notification, notification, stop).await)
            }
            Envelope::Command(command) => {
                let Some(command) = self.modules.command.receiving(command, stop).await else {
                    return Ok(true);
                };
                if self.config.auto_reply_pings && command.is_ping_request() {
                    self.reply_ping(&command).await;
                    return Ok(true);
                }
                if !command.status.is_pending() {
                    let waiter = command.id().and_then(|id| self.pending().remove(id));
                    if let Some(waiter) = waiter {
                        // The caller may have given up waiting.
                        let _ = waiter.send(command);
                        return Ok(true);
                    }
                }
                Ok(deliver(&senders.command, command, stop).await)
            }
            Envelope::Session(session) => {
                let state = session.state;
                self.session_received(&session).await;
                let open = deliver(&senders.session, session, stop).await;
                Ok(open && !state.is_terminal())
            }
        }
    }

    async fn notify_receipt(self: &Arc<Self>, message: &Message) {
        let Some(id) = message.id() else {
            return;
        };
        let mut receipt = Notification::new(Event::Received).with_id(id);
        if let Some(sender) = message.header.sender() {
            receipt = receipt.with_to(sender.clone());
        }
        if let Err(err) = self.send_envelope(receipt.into(), &self.stop).await {
            warn!(error = %err, message_id = id, "failed to send receipt notification");
        }
    }

    async fn reply_ping(self: &Arc<Self>, ping: &Command) {
        trace!(id = ?ping.id(), "answering ping");
        if let Err(err) = self
            .send_envelope(ping.ping_response().into(), &self.stop)
            .await
        {
            warn!(error = %err, "failed to answer ping");
        }
    }

    async fn dequeue<T>(&self, queue: &Mutex<mpsc::Receiver<T>>, cancel: &CancellationToken) -> Result<T> {
        let mut receiver = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            receiver = queue.lock() => receiver,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChannelError::Cancelled),
            item = receiver.recv() => item.ok_or_else(|| self.closed_error()),
        }
    }
}

/// Push `item` into a queue. Returns `false` if the channel is stopping.
async fn deliver<T>(queue: &mpsc::Sender<T>, item: T, stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        sent = queue.send(item) => {
            if sent.is_err() {
                trace!("receive queue closed; envelope dropped");
            }
            true
        }
    }
}
