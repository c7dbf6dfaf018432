//! Async runtime
//!
//! Event loop that owns the [`Session`] and every mounted
//! [`ConversationView`]. Uses `tokio::select!` over transport events, handle
//! commands, store completions, and a periodic tick. All state machines are
//! touched from this one task, so socket broadcasts and durable-write
//! completions are serialized but may arrive in any order.
//!
//! Store calls run on spawned tasks. Their results come back through a
//! completion channel and are applied like any other event. Opening the
//! socket also runs on a task, bounded by a connect timeout, so a peer that
//! never answers cannot stall sends, view changes, or shutdown.

use std::{collections::HashMap, sync::Arc, time::Duration};

use courtside_core::{ConnectionConfig, CredentialProvider, Environment, ReloadTicket};
use courtside_proto::{ChannelId, FacilityId, Message, UserId};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
};

use crate::{
    ChatError, ConnectionStatus, ConversationView, MessageStore, RuntimeError, Session,
    SessionEvent, StoreError, Transport, TransportCommand, TransportEvent, ViewAction, ViewConfig,
    ViewEvent, ViewId, ViewSnapshot,
};

/// Default interval between timer checks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Default capacity of the handle command queue.
pub const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Default limit for a socket to finish opening.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Connection lifecycle settings
    pub connection: ConnectionConfig,
    /// Settings for every mounted view
    pub view: ViewConfig,
    /// Interval between timer checks
    pub tick_interval: Duration,
    /// Capacity of the handle command queue
    pub command_buffer: usize,
    /// Limit for a socket to finish opening; a slower open counts as a
    /// failed attempt
    pub connect_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            view: ViewConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

enum Command {
    Open {
        counterpart: Option<UserId>,
        reply: oneshot::Sender<ViewId>,
    },
    Switch {
        view: ViewId,
        counterpart: Option<UserId>,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Close {
        view: ViewId,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Send {
        view: ViewId,
        content: String,
        reply: oneshot::Sender<Result<Message, ChatError>>,
    },
    Snapshot {
        view: ViewId,
        reply: oneshot::Sender<Result<ViewSnapshot, RuntimeError>>,
    },
    Watch {
        view: ViewId,
        reply: oneshot::Sender<Result<watch::Receiver<ViewSnapshot>, RuntimeError>>,
    },
    Facility {
        facility: FacilityId,
        subscribe: bool,
        reply: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Completion {
    Created {
        view: ViewId,
        content: String,
        result: Result<Message, StoreError>,
        reply: oneshot::Sender<Result<Message, ChatError>>,
    },
    Reloaded {
        view: ViewId,
        ticket: ReloadTicket,
        result: Result<Vec<Message>, StoreError>,
    },
    MarkedRead {
        counterpart: UserId,
        result: Result<(), StoreError>,
    },
}

/// Transport handed back by an open task, with the outcome of the open.
type Opened<T> = (T, Result<(), String>);

struct MountedView<I: courtside_core::MonotonicInstant> {
    model: ConversationView<I>,
    updates: watch::Sender<ViewSnapshot>,
}

/// Cloneable handle to a running [`Runtime`].
#[derive(Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl RuntimeHandle {
    /// Mount a conversation view, optionally with its counterpart.
    pub async fn open_conversation(
        &self,
        counterpart: Option<UserId>,
    ) -> Result<ViewId, RuntimeError> {
        self.request(|reply| Command::Open { counterpart, reply }).await
    }

    /// Change the counterpart of `view`. The old conversation is cleared
    /// before the new one loads.
    pub async fn switch_counterpart(
        &self,
        view: ViewId,
        counterpart: Option<UserId>,
    ) -> Result<(), RuntimeError> {
        self.request(|reply| Command::Switch { view, counterpart, reply }).await?
    }

    /// Unmount `view` and leave its channel.
    pub async fn close_conversation(&self, view: ViewId) -> Result<(), RuntimeError> {
        self.request(|reply| Command::Close { view, reply }).await?
    }

    /// Send a message from `view`.
    ///
    /// Resolves once the durable write finished. On success the stored
    /// record is already in the view and a broadcast was attempted.
    pub async fn send(&self, view: ViewId, content: impl Into<String>) -> Result<Message, ChatError> {
        let content = content.into();
        match self.request(|reply| Command::Send { view, content, reply }).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Stopped),
        }
    }

    /// Current presentation state of `view`.
    pub async fn snapshot(&self, view: ViewId) -> Result<ViewSnapshot, RuntimeError> {
        self.request(|reply| Command::Snapshot { view, reply }).await?
    }

    /// Receiver that observes every presentation change of `view`.
    pub async fn watch_conversation(
        &self,
        view: ViewId,
    ) -> Result<watch::Receiver<ViewSnapshot>, RuntimeError> {
        self.request(|reply| Command::Watch { view, reply }).await?
    }

    /// Hold the channel of `facility`.
    pub async fn subscribe_facility(&self, facility: FacilityId) -> Result<(), RuntimeError> {
        self.request(|reply| Command::Facility { facility, subscribe: true, reply }).await
    }

    /// Release the channel of `facility`.
    pub async fn unsubscribe_facility(&self, facility: FacilityId) -> Result<(), RuntimeError> {
        self.request(|reply| Command::Facility { facility, subscribe: false, reply }).await
    }

    /// Start a new connection attempt, e.g. after an authentication failure.
    pub async fn reconnect(&self) -> Result<(), RuntimeError> {
        self.request(|reply| Command::Reconnect { reply }).await?
    }

    /// Connection status, updated on every change.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Unmount every view, close the socket, and stop the runtime.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            tracing::debug!("runtime already stopped");
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).await.map_err(|_| RuntimeError::Stopped)?;
        response.await.map_err(|_| RuntimeError::Stopped)
    }
}

/// Event loop for one signed-in session.
///
/// # Type Parameters
///
/// - `T`: socket transport
/// - `S`: durable message store
/// - `E`: environment (real or virtual time)
/// - `C`: credential source
pub struct Runtime<T, S, E, C>
where
    T: Transport,
    S: MessageStore,
    E: Environment,
    C: CredentialProvider,
{
    /// `None` while an open task holds the transport
    transport: Option<T>,
    transport_open: bool,
    opening: Option<JoinHandle<Opened<T>>>,
    /// Close requested while opening; applied to the socket once it is back
    close_when_opened: Option<(u16, String)>,
    /// Open requested while an abandoned open was still in flight
    reopen: bool,
    connect_timeout: Duration,
    store: Arc<S>,
    env: E,
    session: Session<E, C>,
    local_user: UserId,
    view_config: ViewConfig,
    tick_interval: Duration,
    views: HashMap<ViewId, MountedView<E::Instant>>,
    next_view: u64,
    commands: mpsc::Receiver<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    status: watch::Sender<ConnectionStatus>,
}

impl<T, S, E, C> Runtime<T, S, E, C>
where
    T: Transport,
    S: MessageStore,
    E: Environment,
    C: CredentialProvider,
{
    /// Create a runtime for `local_user` and the handle that drives it.
    pub fn new(
        transport: T,
        store: S,
        env: E,
        credentials: C,
        local_user: UserId,
        config: RuntimeConfig,
    ) -> (Self, RuntimeHandle) {
        let (command_tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(ConnectionStatus::default());

        let runtime = Self {
            transport: Some(transport),
            transport_open: false,
            opening: None,
            close_when_opened: None,
            reopen: false,
            connect_timeout: config.connect_timeout,
            store: Arc::new(store),
            session: Session::new(env.clone(), credentials, config.connection),
            env,
            local_user,
            view_config: config.view,
            tick_interval: config.tick_interval,
            views: HashMap::new(),
            next_view: 1,
            commands,
            completions,
            completion_tx,
            status,
        };
        let handle = RuntimeHandle { commands: command_tx, status: status_rx };
        (runtime, handle)
    }

    /// Run until [`RuntimeHandle::shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(user = %self.local_user, "conversation runtime started");
        self.connect();
        self.flush_transport().await;

        loop {
            let tick = self.env.sleep(self.tick_interval);

            tokio::select! {
                event = next_event(&mut self.transport), if self.transport_open => {
                    self.on_transport_event(event);
                },
                opened = finish_open(&mut self.opening), if self.opening.is_some() => {
                    self.on_opened(opened).await;
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    },
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    },
                },
                Some(completion) = self.completions.recv() => self.on_completion(completion),
                () = tick => {},
            }

            self.on_tick();
            self.flush_transport().await;
        }

        tracing::info!(user = %self.local_user, "conversation runtime stopped");
    }

    fn connect(&mut self) {
        match self.session.connect() {
            Ok(events) => self.dispatch_session(events),
            Err(err) => {
                tracing::warn!(error = %err, "cannot connect");
                self.status.send_replace(self.session.status());
                self.broadcast_view_event(&ViewEvent::ConnectionFailed { reason: err.to_string() });
            },
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open { counterpart, reply } => {
                let id = self.mount(counterpart);
                let _ = reply.send(id);
            },
            Command::Switch { view, counterpart, reply } => {
                let result = self.view_event(view, ViewEvent::SwitchCounterpart { counterpart });
                let _ = reply.send(result);
            },
            Command::Close { view, reply } => {
                let result = self.unmount(view);
                let _ = reply.send(result);
            },
            Command::Send { view, content, reply } => self.start_send(view, content, reply),
            Command::Snapshot { view, reply } => {
                let result = self
                    .views
                    .get(&view)
                    .map(|v| v.model.snapshot())
                    .ok_or(RuntimeError::UnknownView(view));
                let _ = reply.send(result);
            },
            Command::Watch { view, reply } => {
                let result = self
                    .views
                    .get(&view)
                    .map(|v| v.updates.subscribe())
                    .ok_or(RuntimeError::UnknownView(view));
                let _ = reply.send(result);
            },
            Command::Facility { facility, subscribe, reply } => {
                let channel = ChannelId::Facility(facility);
                if subscribe {
                    self.session.join(channel);
                } else {
                    self.session.leave(&channel);
                }
                let _ = reply.send(());
            },
            Command::Reconnect { reply } => {
                let result = match self.session.connect() {
                    Ok(events) => {
                        self.dispatch_session(events);
                        Ok(())
                    },
                    Err(err) => Err(RuntimeError::from(err)),
                };
                let _ = reply.send(result);
            },
            Command::Shutdown { reply } => {
                // Handled by the loop; reaching here means a second request.
                let _ = reply.send(());
            },
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Created { view, content, result, reply } => {
                let outcome = match self.views.get_mut(&view) {
                    Some(mounted) => {
                        let (actions, outcome) = mounted.model.send_completed(content, result);
                        self.apply_view_actions(view, actions);
                        outcome
                    },
                    None => match result {
                        Ok(message) => {
                            // View closed mid-write; the record still exists.
                            if let Err(err) =
                                self.session.broadcast(message.conversation_id(), message.clone())
                            {
                                tracing::debug!(error = %err, "broadcast skipped");
                            }
                            Ok(message)
                        },
                        Err(source) => Err(ChatError::DurableWriteFailed { content, source }),
                    },
                };
                let _ = reply.send(outcome);
            },
            Completion::Reloaded { view, ticket, result } => {
                if self.view_event(view, ViewEvent::ReloadCompleted { ticket, result }).is_err() {
                    tracing::debug!(%view, "reload finished after view closed");
                }
            },
            Completion::MarkedRead { counterpart, result } => {
                if let Err(err) = result {
                    tracing::warn!(%counterpart, error = %err, "mark-read failed, ignoring");
                }
            },
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let now = self.env.now();
        let events = match event {
            TransportEvent::Text(text) => self.session.handle_text(&text, now),
            TransportEvent::Closed { code, was_clean } => {
                self.transport_open = false;
                self.session.transport_closed(code, was_clean, now)
            },
        };
        self.dispatch_session(events);
    }

    fn on_tick(&mut self) {
        let now = self.env.now();
        let events = self.session.handle_tick(now);
        self.dispatch_session(events);

        let ids: Vec<ViewId> = self.views.keys().copied().collect();
        for id in ids {
            let _ = self.view_event(id, ViewEvent::Tick);
        }
    }

    fn mount(&mut self, counterpart: Option<UserId>) -> ViewId {
        let id = ViewId(self.next_view);
        self.next_view += 1;

        let status = self.session.status();
        let mut model = ConversationView::new(self.local_user, self.view_config.clone());
        let now = self.env.now();
        model.handle(
            ViewEvent::ConnectionChanged {
                connected: status.connected,
                authenticated: status.authenticated,
            },
            now,
        );
        let actions = model.handle(ViewEvent::Mount { counterpart }, now);

        let (updates, _) = watch::channel(model.snapshot());
        self.views.insert(id, MountedView { model, updates });
        tracing::debug!(view = %id, ?counterpart, "view mounted");

        self.apply_view_actions(id, actions);
        id
    }

    fn unmount(&mut self, view: ViewId) -> Result<(), RuntimeError> {
        self.view_event(view, ViewEvent::Unmount)?;
        self.views.remove(&view);
        tracing::debug!(%view, "view closed");
        Ok(())
    }

    fn start_send(
        &mut self,
        view: ViewId,
        content: String,
        reply: oneshot::Sender<Result<Message, ChatError>>,
    ) {
        let Some(mounted) = self.views.get(&view) else {
            let _ = reply.send(Err(ChatError::ViewClosed(view)));
            return;
        };

        let request = match mounted.model.send(&content) {
            Ok(request) => request,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            },
        };

        let store = Arc::clone(&self.store);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = store.create_message(request).await;
            let _ = completions.send(Completion::Created { view, content, result, reply });
        });
    }

    fn spawn_reload(&self, view: ViewId, ticket: ReloadTicket) {
        let store = Arc::clone(&self.store);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = store.list_messages(ticket.counterpart()).await;
            let _ = completions.send(Completion::Reloaded { view, ticket, result });
        });
    }

    fn spawn_mark_read(&self, counterpart: UserId) {
        let store = Arc::clone(&self.store);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = store.mark_read(counterpart).await;
            let _ = completions.send(Completion::MarkedRead { counterpart, result });
        });
    }

    fn view_event(&mut self, view: ViewId, event: ViewEvent) -> Result<(), RuntimeError> {
        let now = self.env.now();
        let mounted = self.views.get_mut(&view).ok_or(RuntimeError::UnknownView(view))?;
        let actions = mounted.model.handle(event, now);
        self.apply_view_actions(view, actions);
        Ok(())
    }

    fn broadcast_view_event(&mut self, event: &ViewEvent) {
        let ids: Vec<ViewId> = self.views.keys().copied().collect();
        for id in ids {
            let _ = self.view_event(id, event.clone());
        }
    }

    fn apply_view_actions(&mut self, view: ViewId, actions: Vec<ViewAction>) {
        for action in actions {
            match action {
                ViewAction::Join(channel) => self.session.join(channel),
                ViewAction::Leave(channel) => self.session.leave(&channel),
                ViewAction::Reload(ticket) => self.spawn_reload(view, ticket),
                ViewAction::Broadcast { conversation_id, message } => {
                    if let Err(err) = self.session.broadcast(conversation_id, message) {
                        tracing::debug!(error = %err, "broadcast skipped, store holds the record");
                    }
                },
                ViewAction::MarkRead { counterpart } => self.spawn_mark_read(counterpart),
                ViewAction::Render => {
                    if let Some(mounted) = self.views.get(&view) {
                        mounted.updates.send_replace(mounted.model.snapshot());
                    }
                },
            }
        }
    }

    fn dispatch_session(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::StatusChanged(status) => {
                    let view_event = ViewEvent::ConnectionChanged {
                        connected: status.connected,
                        authenticated: status.authenticated,
                    };
                    self.status.send_replace(status);
                    self.broadcast_view_event(&view_event);
                },
                SessionEvent::Message { conversation_id, message } => {
                    self.broadcast_view_event(&ViewEvent::Broadcast { conversation_id, message });
                },
                SessionEvent::Error(err) => {
                    self.status.send_replace(self.session.status());
                    if err.is_transient() {
                        tracing::debug!(error = %err, "transient connection error");
                    } else {
                        self.broadcast_view_event(&ViewEvent::ConnectionFailed {
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Execute pending transport commands until none remain.
    async fn flush_transport(&mut self) {
        loop {
            let commands = self.session.take_outgoing();
            if commands.is_empty() {
                return;
            }

            for command in commands {
                match command {
                    TransportCommand::Open => self.open_transport(),
                    TransportCommand::Send(frame) => {
                        let text = match frame.encode() {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(kind = frame.kind(), error = %err, "cannot encode frame");
                                continue;
                            },
                        };
                        let transport = match self.transport.as_mut() {
                            Some(transport) if self.transport_open => transport,
                            _ => {
                                tracing::debug!(kind = frame.kind(), "socket closed, dropping frame");
                                continue;
                            },
                        };
                        tracing::debug!(kind = frame.kind(), "sending frame");
                        if let Err(err) = transport.send_text(text).await {
                            self.transport_failed(err.to_string());
                        }
                    },
                    TransportCommand::Close { code, reason } => {
                        if self.opening.is_some() {
                            self.close_when_opened = Some((code, reason));
                        } else if self.transport_open
                            && let Some(transport) = self.transport.as_mut()
                            && let Err(err) = transport.close(code, reason).await
                        {
                            tracing::debug!(error = %err, "close frame not delivered");
                        }
                        self.transport_open = false;
                        let events = self.session.transport_closed(Some(code), true, self.env.now());
                        self.dispatch_session(events);
                    },
                }
            }
        }
    }

    fn open_transport(&mut self) {
        if self.opening.is_some() {
            tracing::debug!("socket open already in flight");
            self.reopen = self.close_when_opened.is_some();
            return;
        }
        let Some(mut transport) = self.transport.take() else {
            self.transport_failed("transport unavailable".to_string());
            return;
        };

        self.transport_open = false;
        self.close_when_opened = None;
        self.reopen = false;
        let env = self.env.clone();
        let limit = self.connect_timeout;
        self.opening = Some(tokio::spawn(async move {
            let result = tokio::select! {
                result = transport.open() => result.map_err(|err| err.to_string()),
                () = env.sleep(limit) => Err(format!("socket did not open within {limit:?}")),
            };
            (transport, result)
        }));
    }

    async fn on_opened(&mut self, joined: Result<Opened<T>, JoinError>) {
        self.opening = None;
        let (mut transport, result) = match joined {
            Ok(opened) => opened,
            Err(err) => {
                tracing::error!(error = %err, "socket open task failed");
                self.transport_failed(err.to_string());
                return;
            },
        };

        if let Some((code, reason)) = self.close_when_opened.take() {
            // The session already saw this attempt close.
            if result.is_ok()
                && let Err(err) = transport.close(code, reason).await
            {
                tracing::debug!(error = %err, "close frame not delivered");
            }
            self.transport = Some(transport);
            if std::mem::take(&mut self.reopen) {
                self.open_transport();
            }
            return;
        }

        self.transport = Some(transport);
        match result {
            Ok(()) => {
                self.transport_open = true;
                let events = self.session.transport_opened(self.env.now());
                self.dispatch_session(events);
            },
            Err(reason) => self.transport_failed(reason),
        }
    }

    fn transport_failed(&mut self, reason: String) {
        self.transport_open = false;
        let mut events = self.session.transport_error(reason);
        events.extend(self.session.transport_closed(None, false, self.env.now()));
        self.dispatch_session(events);
    }

    async fn shutdown(&mut self) {
        let ids: Vec<ViewId> = self.views.keys().copied().collect();
        for id in ids {
            let _ = self.unmount(id);
        }

        let events = self.session.teardown();
        self.dispatch_session(events);
        self.flush_transport().await;
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
        self.status.send_replace(self.session.status());
    }
}

async fn next_event<T: Transport>(transport: &mut Option<T>) -> TransportEvent {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn finish_open<T: Transport>(
    opening: &mut Option<JoinHandle<Opened<T>>>,
) -> Result<Opened<T>, JoinError> {
    match opening {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
