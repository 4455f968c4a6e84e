use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use shared::{
    domain::{ConversationId, NotificationId, PostId, TempId, UserId},
    protocol::{
        ConversationSummary, Message, MessageBody, Notification, SendMessageRequest, ServerEvent,
        ToggleResponse,
    },
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod events;
pub mod inbox;
pub mod optimistic;
pub mod rooms;
pub mod stream;
pub mod transport;
pub mod unread;

pub use api::{PicstaApi, RestClient};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionOptions, ConnectionState};
pub use delivery::SendStatus;
pub use error::{DeliveryError, RestError};
pub use events::ClientEvent;
pub use stream::{DeliveryState, TimelineEntry};
pub use transport::{SessionAuth, SocketConnector, WebSocketConnector};

use crate::{
    delivery::Outbox,
    inbox::Inbox,
    optimistic::OptimisticToggles,
    stream::{Applied, MessageStream},
    unread::{NotificationCounter, UnreadAggregator},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum ToggleTarget {
    Like(PostId),
    Save(PostId),
    Follow(UserId),
}

struct ClientState {
    streams: HashMap<ConversationId, MessageStream>,
    has_more: HashMap<ConversationId, bool>,
    active_conversation: Option<ConversationId>,
    history_generation: u64,
    inbox: Inbox,
    unread: UnreadAggregator,
    notifications: NotificationCounter,
    notification_list: Vec<Notification>,
    outbox: Outbox,
    likes: OptimisticToggles<PostId>,
    saves: OptimisticToggles<PostId>,
    follows: OptimisticToggles<UserId>,
}

impl ClientState {
    fn stream_mut(&mut self, conversation_id: &ConversationId) -> &mut MessageStream {
        self.streams
            .entry(conversation_id.clone())
            .or_insert_with(|| MessageStream::new(conversation_id.clone()))
    }

    fn begin_toggle(&mut self, target: &ToggleTarget) -> Option<bool> {
        match target {
            ToggleTarget::Like(post_id) => self.likes.begin(post_id.clone()),
            ToggleTarget::Save(post_id) => self.saves.begin(post_id.clone()),
            ToggleTarget::Follow(user_id) => self.follows.begin(user_id.clone()),
        }
    }

    fn confirm_toggle(&mut self, target: &ToggleTarget, active: bool) {
        match target {
            ToggleTarget::Like(post_id) => self.likes.confirm(post_id.clone(), active),
            ToggleTarget::Save(post_id) => self.saves.confirm(post_id.clone(), active),
            ToggleTarget::Follow(user_id) => self.follows.confirm(user_id.clone(), active),
        }
    }

    fn rollback_toggle(&mut self, target: &ToggleTarget) -> bool {
        match target {
            ToggleTarget::Like(post_id) => self.likes.rollback(post_id),
            ToggleTarget::Save(post_id) => self.saves.rollback(post_id),
            ToggleTarget::Follow(user_id) => self.follows.rollback(user_id),
        }
    }
}

fn toggle_event(target: &ToggleTarget, active: bool, count: Option<u64>) -> ClientEvent {
    match target {
        ToggleTarget::Like(post_id) => ClientEvent::PostUpdated {
            post_id: post_id.clone(),
            liked: Some(active),
            saved: None,
            like_count: count,
        },
        ToggleTarget::Save(post_id) => ClientEvent::PostUpdated {
            post_id: post_id.clone(),
            liked: None,
            saved: Some(active),
            like_count: None,
        },
        ToggleTarget::Follow(user_id) => ClientEvent::UserFollowUpdated {
            user_id: user_id.clone(),
            following: active,
        },
    }
}

/// Realtime messaging and notification core for one authenticated session.
pub struct MessagingClient {
    settings: ClientSettings,
    current_user: UserId,
    api: Arc<dyn PicstaApi>,
    connection: Arc<ConnectionManager>,
    inner: Mutex<ClientState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessagingClient {
    /// Client backed by the HTTP API and a websocket transport.
    pub fn new(settings: ClientSettings, current_user: UserId) -> Result<Arc<Self>> {
        let api = Arc::new(RestClient::new(&settings)?);
        Self::new_with_dependencies(settings, current_user, api, Arc::new(WebSocketConnector))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        current_user: UserId,
        api: Arc<dyn PicstaApi>,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Arc<Self>> {
        let auth = SessionAuth {
            socket_url: settings.resolved_socket_url()?,
            session_cookie: settings.session_cookie.clone(),
        };
        let connection =
            ConnectionManager::new(connector, auth, ConnectionOptions::from(&settings));
        let (events, _) = broadcast::channel(1024);
        Ok(Arc::new(Self {
            settings,
            current_user,
            api,
            connection,
            inner: Mutex::new(ClientState {
                streams: HashMap::new(),
                has_more: HashMap::new(),
                active_conversation: None,
                history_generation: 0,
                inbox: Inbox::new(),
                unread: UnreadAggregator::new(),
                notifications: NotificationCounter::new(),
                notification_list: Vec::new(),
                outbox: Outbox::new(),
                likes: OptimisticToggles::new(),
                saves: OptimisticToggles::new(),
                follows: OptimisticToggles::new(),
            }),
            tasks: Mutex::new(Vec::new()),
            events,
        }))
    }

    /// Connects the socket and starts the event pump and the unread poll.
    /// Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut tasks = self.tasks.lock().await;
            if !tasks.is_empty() {
                return;
            }
            let connection_events = self.connection.subscribe();
            tasks.push(tokio::spawn(
                Arc::clone(self).run_connection_events(connection_events),
            ));
            tasks.push(tokio::spawn(Arc::clone(self).run_poll_loop()));
        }
        self.connection.connect().await;
        info!(user_id = %self.current_user, "client: started");
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.connection.disconnect().await;
        info!("client: stopped");
    }

    /// Makes `conversation_id` the active conversation: switches rooms, zeroes
    /// its unread count and loads the newest history page.
    pub async fn open_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), RestError> {
        let (previous, generation, total) = {
            let mut state = self.inner.lock().await;
            let previous = state.active_conversation.replace(conversation_id.clone());
            state.history_generation += 1;
            state.stream_mut(conversation_id);
            state.unread.on_conversation_opened(conversation_id);
            (previous, state.history_generation, state.unread.total())
        };
        self.emit(ClientEvent::UnreadChanged {
            conversation_id: Some(conversation_id.clone()),
            total,
        });

        if let Some(previous) = previous.filter(|previous| previous != conversation_id) {
            self.connection.leave_room(&previous).await;
        }
        self.connection.join_room(conversation_id.clone()).await;
        self.sync_read(conversation_id).await;

        let page = self
            .api
            .list_messages(conversation_id, self.settings.page_size(), None)
            .await?;

        let mut state = self.inner.lock().await;
        if state.active_conversation.as_ref() != Some(conversation_id)
            || state.history_generation != generation
        {
            debug!(conversation_id = %conversation_id, "history: dropping stale page");
            return Ok(());
        }
        state.has_more.insert(conversation_id.clone(), page.has_more);
        let inserted = state
            .stream_mut(conversation_id)
            .apply_history_page(page.messages);
        debug!(conversation_id = %conversation_id, inserted, "history: first page applied");
        self.emit(ClientEvent::TimelineChanged {
            conversation_id: conversation_id.clone(),
        });
        Ok(())
    }

    pub async fn close_conversation(&self) {
        let previous = {
            let mut state = self.inner.lock().await;
            state.history_generation += 1;
            state.active_conversation.take()
        };
        if let Some(previous) = previous {
            self.connection.leave_room(&previous).await;
        }
    }

    /// Subscribes to a conversation's room without making it active, e.g.
    /// for live previews in the conversation list.
    pub async fn join_room(&self, conversation_id: &ConversationId) -> bool {
        self.connection.join_room(conversation_id.clone()).await
    }

    pub async fn leave_room(&self, conversation_id: &ConversationId) -> bool {
        self.connection.leave_room(conversation_id).await
    }

    /// Fetches the page before the oldest loaded message. Returns the number
    /// of rows added; zero once the server reported no more history.
    pub async fn load_older(&self, conversation_id: &ConversationId) -> Result<usize, RestError> {
        let (before, generation) = {
            let mut state = self.inner.lock().await;
            if state.has_more.get(conversation_id) == Some(&false) {
                return Ok(0);
            }
            (
                state.stream_mut(conversation_id).oldest_id().cloned(),
                state.history_generation,
            )
        };
        let page = self
            .api
            .list_messages(conversation_id, self.settings.page_size(), before.as_ref())
            .await?;

        let mut state = self.inner.lock().await;
        if state.history_generation != generation {
            debug!(conversation_id = %conversation_id, "history: dropping stale older page");
            return Ok(0);
        }
        state.has_more.insert(conversation_id.clone(), page.has_more);
        let inserted = state
            .stream_mut(conversation_id)
            .apply_history_page(page.messages);
        if inserted > 0 {
            self.emit(ClientEvent::TimelineChanged {
                conversation_id: conversation_id.clone(),
            });
        }
        Ok(inserted)
    }

    /// Shows the message immediately and delivers it. A failed delivery stays
    /// in the timeline as failed until [`Self::retry`] succeeds.
    pub async fn send(&self, conversation_id: &ConversationId, body: MessageBody) -> TempId {
        let temp_id = TempId::generate();
        let request = {
            let mut state = self.inner.lock().await;
            state.stream_mut(conversation_id).apply_optimistic(
                temp_id.clone(),
                self.current_user.clone(),
                body.clone(),
                Utc::now(),
            );
            state
                .outbox
                .enqueue(temp_id.clone(), conversation_id.clone(), body)
                .request()
        };
        self.emit(ClientEvent::TimelineChanged {
            conversation_id: conversation_id.clone(),
        });
        self.deliver(request).await;
        temp_id
    }

    pub async fn send_text(
        &self,
        conversation_id: &ConversationId,
        text: impl Into<String>,
    ) -> TempId {
        self.send(conversation_id, MessageBody::text(text)).await
    }

    /// Resends a failed message under the same temp id.
    pub async fn retry(&self, temp_id: &TempId) -> Result<(), DeliveryError> {
        let request = {
            let mut state = self.inner.lock().await;
            let outbound = state.outbox.begin_retry(temp_id)?;
            state
                .stream_mut(&outbound.conversation_id)
                .mark_pending(temp_id);
            info!(temp_id = %temp_id, attempt = outbound.attempts, "delivery: retrying send");
            outbound.request()
        };
        self.emit(ClientEvent::TimelineChanged {
            conversation_id: request.conversation_id.clone(),
        });
        self.deliver(request).await;
        Ok(())
    }

    pub async fn delivery_status(&self, temp_id: &TempId) -> Option<SendStatus> {
        self.inner
            .lock()
            .await
            .outbox
            .get(temp_id)
            .map(|message| message.status.clone())
    }

    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage { message } => self.on_new_message(message).await,
            ServerEvent::MessageAck { client_id, message } => {
                self.settle_from_socket(&client_id, message).await
            }
            ServerEvent::MessagesDeleted {
                conversation_id,
                message_ids,
            } => {
                let removed = self
                    .inner
                    .lock()
                    .await
                    .stream_mut(&conversation_id)
                    .remove(&message_ids);
                if removed > 0 {
                    self.emit(ClientEvent::TimelineChanged { conversation_id });
                }
            }
            ServerEvent::ChatUpdated { conversation } => {
                self.inner.lock().await.inbox.upsert(conversation);
                self.emit(ClientEvent::InboxChanged);
            }
            ServerEvent::NewNotification { notification } => {
                let unread = {
                    let mut state = self.inner.lock().await;
                    state.notifications.on_notification_arrived();
                    state.notification_list.insert(0, notification.clone());
                    state.notifications.unread()
                };
                self.emit(ClientEvent::NotificationReceived(notification));
                self.emit(ClientEvent::NotificationsChanged { unread });
            }
            ServerEvent::Pong => {}
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, "socket: server reported error: {}", err.message);
                self.emit(ClientEvent::Error(err.message));
            }
        }
    }

    /// Refetches the newest page of each room that was re-joined after a
    /// dropped link, covering events missed while offline.
    pub async fn reconcile_after_reconnect(&self, rooms: &[ConversationId]) {
        let limit = self.settings.page_size();
        let pages = join_all(rooms.iter().map(|conversation_id| async move {
            (
                conversation_id,
                self.api.list_messages(conversation_id, limit, None).await,
            )
        }))
        .await;

        for (conversation_id, page) in pages {
            if !self.connection.is_joined(conversation_id).await {
                debug!(conversation_id = %conversation_id, "reconnect: room left, dropping page");
                continue;
            }
            match page {
                Ok(page) => {
                    let inserted = self
                        .inner
                        .lock()
                        .await
                        .stream_mut(conversation_id)
                        .apply_history_page(page.messages);
                    debug!(conversation_id = %conversation_id, inserted, "reconnect: room reconciled");
                    if inserted > 0 {
                        self.emit(ClientEvent::TimelineChanged {
                            conversation_id: conversation_id.clone(),
                        });
                    }
                }
                Err(err) => {
                    warn!(conversation_id = %conversation_id, "reconnect: history refetch failed: {err}");
                }
            }
        }
    }

    /// One authoritative unread sync. Mark-reads that failed earlier are
    /// retried first so the overwrite cannot resurrect a read badge.
    pub async fn poll_once(&self) -> Result<(), RestError> {
        let (pending_reads, notifications_pending) = {
            let mut state = self.inner.lock().await;
            state.outbox.prune_sent();
            (
                state.unread.pending_mark_reads(),
                state.notifications.mark_all_pending(),
            )
        };
        for conversation_id in &pending_reads {
            self.sync_read(conversation_id).await;
        }
        if notifications_pending {
            self.sync_notifications_read().await;
        }

        let (unread_token, notifications_token) = {
            let state = self.inner.lock().await;
            (state.unread.sync_token(), state.notifications.sync_token())
        };
        let counts = self.api.unread_counts().await?;
        let (total, notifications) = {
            let mut state = self.inner.lock().await;
            state.unread.overwrite_from(&counts, unread_token);
            state
                .notifications
                .overwrite(counts.notifications, notifications_token);
            (state.unread.total(), state.notifications.unread())
        };
        debug!(total, notifications, "poll: unread counts refreshed");
        self.emit(ClientEvent::UnreadChanged {
            conversation_id: None,
            total,
        });
        self.emit(ClientEvent::NotificationsChanged {
            unread: notifications,
        });
        Ok(())
    }

    pub async fn refresh_inbox(&self) -> Result<Vec<ConversationSummary>, RestError> {
        let conversations = self.api.list_conversations().await?;
        let visible = {
            let mut state = self.inner.lock().await;
            state.inbox.replace_all(conversations);
            state.inbox.visible()
        };
        self.emit(ClientEvent::InboxChanged);
        Ok(visible)
    }

    /// Removes the conversation from this participant's list. It comes back
    /// when a new message arrives.
    pub async fn hide_conversation(&self, conversation_id: &ConversationId) -> Result<(), RestError> {
        let hidden = self.inner.lock().await.inbox.hide(conversation_id);
        if hidden {
            self.emit(ClientEvent::InboxChanged);
        }
        if let Err(err) = self.api.hide_conversation(conversation_id).await {
            if hidden {
                self.inner.lock().await.inbox.unhide(conversation_id);
                self.emit(ClientEvent::InboxChanged);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Zeroes the notification badge, loads the list and marks it read.
    pub async fn open_notifications(&self) -> Result<Vec<Notification>, RestError> {
        self.inner.lock().await.notifications.on_notifications_opened();
        self.emit(ClientEvent::NotificationsChanged { unread: 0 });

        let notifications = self.api.list_notifications().await?;
        self.inner.lock().await.notification_list = notifications;
        self.sync_notifications_read().await;
        Ok(self.notifications().await)
    }

    pub async fn delete_notification(
        &self,
        notification_id: &NotificationId,
    ) -> Result<(), RestError> {
        self.api.delete_notification(notification_id).await?;
        let unread = {
            let mut state = self.inner.lock().await;
            let removed_unread = state
                .notification_list
                .iter()
                .any(|notification| &notification.id == notification_id && !notification.read);
            state
                .notification_list
                .retain(|notification| &notification.id != notification_id);
            if removed_unread {
                state.notifications.on_notification_removed();
            }
            state.notifications.unread()
        };
        self.emit(ClientEvent::NotificationsChanged { unread });
        Ok(())
    }

    pub async fn clear_notifications(&self) -> Result<(), RestError> {
        self.api.clear_notifications().await?;
        {
            let mut state = self.inner.lock().await;
            state.notification_list.clear();
            state.notifications.clear();
        }
        self.emit(ClientEvent::NotificationsChanged { unread: 0 });
        Ok(())
    }

    /// Returns the confirmed state, or `None` when a toggle for the same post
    /// is still in flight.
    pub async fn toggle_like(&self, post_id: &PostId) -> Result<Option<bool>, RestError> {
        self.toggle(ToggleTarget::Like(post_id.clone())).await
    }

    pub async fn toggle_save(&self, post_id: &PostId) -> Result<Option<bool>, RestError> {
        self.toggle(ToggleTarget::Save(post_id.clone())).await
    }

    pub async fn toggle_follow(&self, user_id: &UserId) -> Result<Option<bool>, RestError> {
        self.toggle(ToggleTarget::Follow(user_id.clone())).await
    }

    /// Records like/save state delivered with a feed or post payload.
    pub async fn seed_post(&self, post_id: &PostId, liked: bool, saved: bool) {
        let mut state = self.inner.lock().await;
        state.likes.seed(post_id.clone(), liked);
        state.saves.seed(post_id.clone(), saved);
    }

    pub async fn seed_follow(&self, user_id: &UserId, following: bool) {
        self.inner
            .lock()
            .await
            .follows
            .seed(user_id.clone(), following);
    }

    pub async fn is_liked(&self, post_id: &PostId) -> bool {
        self.inner.lock().await.likes.current(post_id)
    }

    pub async fn is_saved(&self, post_id: &PostId) -> bool {
        self.inner.lock().await.saves.current(post_id)
    }

    pub async fn is_following(&self, user_id: &UserId) -> bool {
        self.inner.lock().await.follows.current(user_id)
    }

    pub async fn timeline(&self, conversation_id: &ConversationId) -> Vec<TimelineEntry> {
        self.inner
            .lock()
            .await
            .streams
            .get(conversation_id)
            .map(|stream| stream.entries().to_vec())
            .unwrap_or_default()
    }

    pub async fn inbox(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.inbox.visible()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().await.notification_list.clone()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.active_conversation.clone()
    }

    pub async fn unread_total(&self) -> u64 {
        self.inner.lock().await.unread.total()
    }

    pub async fn unread_count(&self, conversation_id: &ConversationId) -> u32 {
        self.inner.lock().await.unread.count(conversation_id)
    }

    pub async fn notification_unread(&self) -> u32 {
        self.inner.lock().await.notifications.unread()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run_connection_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Server(event)) => self.handle_server_event(event).await,
                Ok(ConnectionEvent::StateChanged(state)) => {
                    self.emit(ClientEvent::ConnectionChanged(state));
                }
                Ok(ConnectionEvent::Reconnected { rooms }) => {
                    self.reconcile_after_reconnect(&rooms).await;
                }
                Ok(ConnectionEvent::Disconnected { reason }) => {
                    debug!(reason = reason.as_deref().unwrap_or("none"), "client: link down");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client: connection events lagged, refetching joined rooms");
                    let rooms = self.connection.joined_rooms().await;
                    self.reconcile_after_reconnect(&rooms).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = self.poll_once().await {
                warn!("poll: unread sync failed: {err}");
            }
        }
    }

    async fn on_new_message(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let own = message.sender_id == self.current_user;

        let (applied, settled, unread_total, is_active, known) = {
            let mut state = self.inner.lock().await;
            let is_active = state.active_conversation.as_ref() == Some(&conversation_id);
            let settled = match &message.client_id {
                Some(temp_id) => state
                    .outbox
                    .confirm_delivered(temp_id, message.id.clone())
                    .then(|| temp_id.clone()),
                None => None,
            };
            let known = state.inbox.touch(&message);
            let applied = state
                .stream_mut(&conversation_id)
                .apply_incoming(message.clone());
            let counts_as_unread = !own && applied != Applied::Duplicate;
            let unread_total = if counts_as_unread
                && state.unread.on_message_arrived(&conversation_id, is_active)
            {
                Some(state.unread.total())
            } else {
                None
            };
            (applied, settled, unread_total, is_active, known)
        };

        if let Some(temp_id) = settled {
            self.emit(ClientEvent::MessageSent {
                conversation_id: conversation_id.clone(),
                temp_id,
                message_id: message.id.clone(),
            });
        }
        if applied != Applied::Duplicate {
            self.emit(ClientEvent::TimelineChanged {
                conversation_id: conversation_id.clone(),
            });
        }
        if let Some(total) = unread_total {
            self.emit(ClientEvent::UnreadChanged {
                conversation_id: Some(conversation_id.clone()),
                total,
            });
        }
        if known {
            self.emit(ClientEvent::InboxChanged);
        } else if let Err(err) = self.refresh_inbox().await {
            warn!(conversation_id = %conversation_id, "inbox: refresh for new conversation failed: {err}");
        }

        if is_active && !own && applied == Applied::Inserted {
            self.inner
                .lock()
                .await
                .unread
                .on_conversation_opened(&conversation_id);
            self.sync_read(&conversation_id).await;
        }
    }

    async fn settle_from_socket(&self, temp_id: &TempId, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();
        let (settled, applied) = {
            let mut state = self.inner.lock().await;
            let settled = state.outbox.confirm_delivered(temp_id, message_id.clone());
            state.inbox.touch(&message);
            let applied = state.stream_mut(&conversation_id).reconcile(temp_id, message);
            (settled, applied)
        };
        if settled {
            self.emit(ClientEvent::MessageSent {
                conversation_id: conversation_id.clone(),
                temp_id: temp_id.clone(),
                message_id,
            });
        }
        if applied != Applied::Duplicate {
            self.emit(ClientEvent::TimelineChanged { conversation_id });
        }
    }

    async fn deliver(&self, request: SendMessageRequest) {
        let temp_id = &request.client_id;
        let conversation_id = &request.conversation_id;
        match self.api.send_message(&request).await {
            Ok(message) => {
                let message_id = message.id.clone();
                let settled = {
                    let mut state = self.inner.lock().await;
                    let settled = match state.outbox.mark_sent(temp_id, message_id.clone()) {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(temp_id = %temp_id, "delivery: already settled: {err}");
                            false
                        }
                    };
                    state.inbox.touch(&message);
                    state.stream_mut(conversation_id).reconcile(temp_id, message);
                    settled
                };
                if settled {
                    debug!(temp_id = %temp_id, message_id = %message_id, "delivery: sent");
                    self.emit(ClientEvent::MessageSent {
                        conversation_id: conversation_id.clone(),
                        temp_id: temp_id.clone(),
                        message_id,
                    });
                }
                self.emit(ClientEvent::TimelineChanged {
                    conversation_id: conversation_id.clone(),
                });
            }
            Err(err) => {
                let reason = err.to_string();
                let failed = {
                    let mut state = self.inner.lock().await;
                    state.outbox.mark_failed(temp_id, reason.clone()).is_ok()
                        && state.stream_mut(conversation_id).mark_failed(temp_id, reason.clone())
                };
                if !failed {
                    debug!(temp_id = %temp_id, "delivery: send error after settle ignored: {reason}");
                    return;
                }
                warn!(
                    temp_id = %temp_id,
                    conversation_id = %conversation_id,
                    transient = err.is_transient(),
                    "delivery: send failed: {reason}"
                );
                self.emit(ClientEvent::SendFailed {
                    conversation_id: conversation_id.clone(),
                    temp_id: temp_id.clone(),
                    reason,
                });
                self.emit(ClientEvent::TimelineChanged {
                    conversation_id: conversation_id.clone(),
                });
            }
        }
    }

    async fn sync_read(&self, conversation_id: &ConversationId) {
        match self.api.mark_conversation_read(conversation_id).await {
            Ok(()) => self
                .inner
                .lock()
                .await
                .unread
                .mark_read_confirmed(conversation_id),
            Err(err) => {
                warn!(conversation_id = %conversation_id, "unread: mark-read failed, retrying on next poll: {err}");
            }
        }
    }

    async fn sync_notifications_read(&self) {
        match self.api.mark_notifications_read().await {
            Ok(()) => {
                let mut state = self.inner.lock().await;
                state.notifications.confirm_opened();
                for notification in &mut state.notification_list {
                    notification.read = true;
                }
            }
            Err(err) => warn!("notifications: mark-read failed, retrying on next poll: {err}"),
        }
    }

    async fn toggle(&self, target: ToggleTarget) -> Result<Option<bool>, RestError> {
        let Some(desired) = self.inner.lock().await.begin_toggle(&target) else {
            debug!(?target, "toggle: already in flight");
            return Ok(None);
        };
        self.emit(toggle_event(&target, desired, None));

        let response: Result<ToggleResponse, RestError> = match &target {
            ToggleTarget::Like(post_id) => self.api.toggle_like(post_id).await,
            ToggleTarget::Save(post_id) => self.api.toggle_save(post_id).await,
            ToggleTarget::Follow(user_id) => self.api.toggle_follow(user_id).await,
        };

        match response {
            Ok(response) => {
                self.inner
                    .lock()
                    .await
                    .confirm_toggle(&target, response.active);
                self.emit(toggle_event(&target, response.active, response.count));
                Ok(Some(response.active))
            }
            Err(err) => {
                let fallback = self.inner.lock().await.rollback_toggle(&target);
                warn!(?target, "toggle: rolled back: {err}");
                self.emit(toggle_event(&target, fallback, None));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
