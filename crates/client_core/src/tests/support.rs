//! Channel-backed socket for tests: every successful `connect` hands the
//! server side of the link to the test through `remotes`.

use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ConversationId, MessageId, NotificationId, PostId, UserId},
    error::{ApiException, ErrorCode},
    protocol::{
        ClientRequest, ConversationSummary, Message, MessageBody, MessagePage, Notification,
        SendMessageRequest, ServerEvent, ToggleResponse, UnreadCounts,
    },
};
use tokio::sync::{mpsc, Mutex};

use crate::{
    api::PicstaApi,
    error::RestError,
    transport::{LinkEvent, SessionAuth, SocketConnector, SocketLink},
};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

pub(crate) struct RemoteEnd {
    pub requests: mpsc::UnboundedReceiver<ClientRequest>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

impl RemoteEnd {
    pub fn push(&self, event: ServerEvent) {
        self.events
            .send(LinkEvent::Event(event))
            .expect("link still open");
    }

    /// Next join/leave frame, skipping heartbeats.
    pub async fn next_request(&mut self) -> ClientRequest {
        loop {
            let request = within(self.requests.recv())
                .await
                .expect("link closed before request");
            if request != ClientRequest::Ping {
                return request;
            }
        }
    }
}

pub(crate) struct MockConnector {
    attempts: AtomicU32,
    fail_first: u32,
    remotes: Mutex<Option<mpsc::UnboundedSender<RemoteEnd>>>,
}

impl MockConnector {
    pub fn new(fail_first: u32) -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                attempts: AtomicU32::new(0),
                fail_first,
                remotes: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(&self, _auth: &SessionAuth) -> Result<SocketLink> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(anyhow!("connection refused (attempt {attempt})"));
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let remotes = self.remotes.lock().await;
        let Some(remotes) = remotes.as_ref() else {
            return Err(anyhow!("mock connector closed"));
        };
        remotes
            .send(RemoteEnd {
                requests: outbound_rx,
                events: inbound_tx,
            })
            .map_err(|_| anyhow!("test dropped the remote receiver"))?;
        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[derive(Default)]
pub(crate) struct MockApiState {
    pub calls: Vec<String>,
    pub pages: HashMap<ConversationId, MessagePage>,
    pub page_delays: HashMap<ConversationId, Duration>,
    /// Keyed by message text.
    pub send_delays: HashMap<String, Duration>,
    /// Keyed by message text; otherwise ids are `m{n}` in response order.
    /// Timestamps follow request order.
    pub send_ids: HashMap<String, MessageId>,
    pub failing_sends: u32,
    pub fail_mark_read: bool,
    pub fail_notifications_read: bool,
    pub fail_toggles: bool,
    pub unread: UnreadCounts,
    pub notifications: Vec<Notification>,
    pub conversations: Vec<ConversationSummary>,
    pub counts_delay: Option<Duration>,
    received: u32,
    responses: u32,
}

/// Recording [`PicstaApi`] double. Every call is logged as `name:arg`.
#[derive(Default)]
pub(crate) struct MockApi {
    pub state: Mutex<MockApiState>,
}

impl MockApi {
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .await
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    async fn record(&self, call: String) {
        self.state.lock().await.calls.push(call);
    }

    async fn toggle(&self, call: String) -> Result<ToggleResponse, RestError> {
        let mut state = self.state.lock().await;
        state.calls.push(call);
        if state.fail_toggles {
            return Err(unavailable("toggle rejected"));
        }
        Ok(ToggleResponse {
            active: true,
            count: Some(7),
        })
    }
}

pub(crate) fn unavailable(message: &str) -> RestError {
    RestError::Api(ApiException::new(ErrorCode::Unavailable, message))
}

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn text_message(
    id: &str,
    conversation: &str,
    sender: &str,
    text: &str,
    secs: i64,
) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from(sender),
        body: MessageBody::text(text),
        created_at: at(secs),
        client_id: None,
    }
}

fn body_text(body: &MessageBody) -> String {
    match body {
        MessageBody::Text { text } => text.clone(),
        MessageBody::SharedPost { post_id, .. } => post_id.to_string(),
    }
}

#[async_trait]
impl PicstaApi for MockApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RestError> {
        let mut state = self.state.lock().await;
        state.calls.push("list_conversations".to_string());
        Ok(state.conversations.clone())
    }

    async fn create_conversation(
        &self,
        participant_ids: Vec<UserId>,
    ) -> Result<ConversationSummary, RestError> {
        self.record(format!("create_conversation:{}", participant_ids.len()))
            .await;
        Err(unavailable("not scripted"))
    }

    async fn hide_conversation(&self, conversation_id: &ConversationId) -> Result<(), RestError> {
        self.record(format!("hide:{conversation_id}")).await;
        Ok(())
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), RestError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("mark_read:{conversation_id}"));
        if state.fail_mark_read {
            return Err(unavailable("read receipts are down"));
        }
        Ok(())
    }

    async fn unread_counts(&self) -> Result<UnreadCounts, RestError> {
        let (delay, counts) = {
            let mut state = self.state.lock().await;
            state.calls.push("unread_counts".to_string());
            (state.counts_delay, state.unread.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(counts)
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        _limit: u32,
        before: Option<&MessageId>,
    ) -> Result<MessagePage, RestError> {
        let (delay, page) = {
            let mut state = self.state.lock().await;
            state.calls.push(match before {
                Some(before) => format!("list_messages:{conversation_id}:{before}"),
                None => format!("list_messages:{conversation_id}"),
            });
            (
                state.page_delays.get(conversation_id).copied(),
                state.pages.get(conversation_id).cloned().unwrap_or_default(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(page)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, RestError> {
        let text = body_text(&request.body);
        let (stamp, delay) = {
            let mut state = self.state.lock().await;
            state.calls.push(format!("send:{text}"));
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(unavailable("send rejected"));
            }
            state.received += 1;
            (state.received, state.send_delays.get(&text).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        state.responses += 1;
        let n = state.responses;
        let id = state
            .send_ids
            .get(&text)
            .cloned()
            .unwrap_or_else(|| MessageId::from(format!("m{n}")));
        Ok(Message {
            id,
            conversation_id: request.conversation_id.clone(),
            sender_id: UserId::from("me"),
            body: request.body.clone(),
            created_at: at(1_000 + i64::from(stamp)),
            client_id: Some(request.client_id.clone()),
        })
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, RestError> {
        let mut state = self.state.lock().await;
        state.calls.push("list_notifications".to_string());
        Ok(state.notifications.clone())
    }

    async fn mark_notifications_read(&self) -> Result<(), RestError> {
        let mut state = self.state.lock().await;
        state.calls.push("mark_notifications_read".to_string());
        if state.fail_notifications_read {
            return Err(unavailable("notifications are down"));
        }
        Ok(())
    }

    async fn delete_notification(
        &self,
        notification_id: &NotificationId,
    ) -> Result<(), RestError> {
        self.record(format!("delete_notification:{notification_id}"))
            .await;
        Ok(())
    }

    async fn clear_notifications(&self) -> Result<(), RestError> {
        self.record("clear_notifications".to_string()).await;
        Ok(())
    }

    async fn toggle_like(&self, post_id: &PostId) -> Result<ToggleResponse, RestError> {
        self.toggle(format!("like:{post_id}")).await
    }

    async fn toggle_save(&self, post_id: &PostId) -> Result<ToggleResponse, RestError> {
        self.toggle(format!("save:{post_id}")).await
    }

    async fn toggle_follow(&self, user_id: &UserId) -> Result<ToggleResponse, RestError> {
        self.toggle(format!("follow:{user_id}")).await
    }
}

pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting in test")
}

pub(crate) fn fast_options() -> crate::connection::ConnectionOptions {
    crate::connection::ConnectionOptions {
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(120),
    }
}
