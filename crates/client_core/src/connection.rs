//! Socket lifecycle: one transport per session, reconnect with capped
//! exponential backoff, room replay after every successful connect.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::ConversationId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::{
    config::ClientSettings,
    rooms::RoomMembership,
    transport::{LinkEvent, SessionAuth, SocketConnector, SocketLink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Server(ServerEvent),
    StateChanged(ConnectionState),
    /// A dropped link came back; `rooms` were re-joined and may have missed events.
    Reconnected { rooms: Vec<ConversationId> },
    Disconnected { reason: Option<String> },
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl From<&ClientSettings> for ConnectionOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            backoff_initial: settings.backoff_initial,
            backoff_max: settings.backoff_max,
            heartbeat_interval: settings.heartbeat_interval,
            heartbeat_timeout: settings.heartbeat_timeout,
        }
    }
}

struct ConnectionInner {
    rooms: RoomMembership,
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    supervisor: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    connector: Arc<dyn SocketConnector>,
    auth: SessionAuth,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    inner: Mutex<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        auth: SessionAuth,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            connector,
            auth,
            options,
            state,
            events,
            inner: Mutex::new(ConnectionInner {
                rooms: RoomMembership::new(),
                outbound: None,
                supervisor: None,
            }),
        })
    }

    /// Starts the supervisor. A no-op while one is already running.
    pub async fn connect(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner
            .supervisor
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let manager = Arc::clone(self);
        inner.supervisor = Some(tokio::spawn(async move { manager.supervise().await }));
    }

    /// Tears the transport down and forgets every joined room.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut inner = self.inner.lock().await;
            inner.outbound = None;
            inner.rooms.clear();
            inner.supervisor.take()
        };
        if let Some(task) = supervisor {
            task.abort();
            let _ = task.await;
        }
        self.publish_state(ConnectionState::Disconnected);
    }

    /// Returns `false` when the room was already joined.
    pub async fn join_room(&self, conversation_id: ConversationId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.rooms.join(conversation_id.clone()) {
            return false;
        }
        if let Some(outbound) = &inner.outbound {
            let _ = outbound.send(ClientRequest::JoinChat { conversation_id });
        }
        true
    }

    /// Returns `false` when the room was not joined.
    pub async fn leave_room(&self, conversation_id: &ConversationId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.rooms.leave(conversation_id) {
            return false;
        }
        if let Some(outbound) = &inner.outbound {
            let _ = outbound.send(ClientRequest::LeaveChat {
                conversation_id: conversation_id.clone(),
            });
        }
        true
    }

    pub async fn joined_rooms(&self) -> Vec<ConversationId> {
        self.inner.lock().await.rooms.rooms().cloned().collect()
    }

    pub async fn is_joined(&self, conversation_id: &ConversationId) -> bool {
        self.inner.lock().await.rooms.contains(conversation_id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn publish_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            let _ = self.events.send(ConnectionEvent::StateChanged(state));
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.options.backoff_initial, self.options.backoff_max);
        let mut connected_before = false;

        loop {
            if !connected_before && backoff.attempt() == 0 {
                self.publish_state(ConnectionState::Connecting);
            }

            match self.connector.connect(&self.auth).await {
                Ok(link) => {
                    backoff.reset();
                    let rooms = self.attach(link.outbound.clone()).await;
                    self.publish_state(ConnectionState::Connected);
                    if connected_before {
                        info!(rooms = rooms.len(), "connection: reconnected, rooms replayed");
                        let _ = self.events.send(ConnectionEvent::Reconnected { rooms });
                    } else {
                        info!(rooms = rooms.len(), "connection: connected");
                    }
                    connected_before = true;

                    let reason = self.pump(link).await;
                    self.inner.lock().await.outbound = None;
                    warn!(
                        reason = reason.as_deref().unwrap_or("none"),
                        "connection: link lost"
                    );
                    let _ = self.events.send(ConnectionEvent::Disconnected { reason });
                }
                Err(err) => {
                    warn!(attempt = backoff.attempt() + 1, "connection: connect failed: {err:#}");
                }
            }

            let delay = backoff.next_delay();
            self.publish_state(ConnectionState::Reconnecting {
                attempt: backoff.attempt(),
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn attach(&self, outbound: mpsc::UnboundedSender<ClientRequest>) -> Vec<ConversationId> {
        let mut inner = self.inner.lock().await;
        let rooms: Vec<ConversationId> = inner.rooms.rooms().cloned().collect();
        for conversation_id in &rooms {
            let _ = outbound.send(ClientRequest::JoinChat {
                conversation_id: conversation_id.clone(),
            });
        }
        inner.outbound = Some(outbound);
        rooms
    }

    async fn pump(&self, mut link: SocketLink) -> Option<String> {
        let mut heartbeat =
            tokio::time::interval(self.options.heartbeat_interval.max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                event = link.inbound.recv() => match event {
                    Some(LinkEvent::Event(ServerEvent::Pong)) => last_seen = Instant::now(),
                    Some(LinkEvent::Event(event)) => {
                        last_seen = Instant::now();
                        let _ = self.events.send(ConnectionEvent::Server(event));
                    }
                    Some(LinkEvent::Closed(reason)) => return reason,
                    None => return Some("transport closed".to_string()),
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.options.heartbeat_timeout {
                        return Some("heartbeat timed out".to_string());
                    }
                    if link.outbound.send(ClientRequest::Ping).is_err() {
                        return Some("outbound closed".to_string());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
