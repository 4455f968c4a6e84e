use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, COOKIE},
    Client, RequestBuilder,
};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, MessageId, NotificationId, PostId, UserId},
    error::{ApiException, ErrorCode},
    protocol::{
        ConversationSummary, CreateConversationRequest, Envelope, Message, MessagePage,
        Notification, SendMessageRequest, ToggleResponse, UnreadCounts,
    },
};
use tracing::debug;

use crate::{config::ClientSettings, error::RestError};

/// REST surface the realtime core consumes.
#[async_trait]
pub trait PicstaApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RestError>;
    async fn create_conversation(
        &self,
        participant_ids: Vec<UserId>,
    ) -> Result<ConversationSummary, RestError>;
    async fn hide_conversation(&self, conversation_id: &ConversationId) -> Result<(), RestError>;
    async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), RestError>;
    async fn unread_counts(&self) -> Result<UnreadCounts, RestError>;
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<MessagePage, RestError>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, RestError>;
    async fn list_notifications(&self) -> Result<Vec<Notification>, RestError>;
    async fn mark_notifications_read(&self) -> Result<(), RestError>;
    async fn delete_notification(&self, notification_id: &NotificationId)
        -> Result<(), RestError>;
    async fn clear_notifications(&self) -> Result<(), RestError>;
    async fn toggle_like(&self, post_id: &PostId) -> Result<ToggleResponse, RestError>;
    async fn toggle_save(&self, post_id: &PostId) -> Result<ToggleResponse, RestError>;
    async fn toggle_follow(&self, user_id: &UserId) -> Result<ToggleResponse, RestError>;
}

#[derive(Serialize)]
struct ListMessagesQuery<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a str>,
}

pub struct RestClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl RestClient {
    pub fn new(settings: &ClientSettings) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &settings.session_cookie {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(cookie).context("session cookie is not a valid header")?,
            );
        }
        let http = Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            timeout: settings.request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Envelope<T>, RestError> {
        let call = async {
            let response = request.send().await?;
            let status = response.status();
            let bytes = response.bytes().await?;

            if !status.is_success() {
                let message = serde_json::from_slice::<Envelope<serde_json::Value>>(&bytes)
                    .ok()
                    .and_then(|envelope| envelope.message)
                    .unwrap_or_else(|| status.to_string());
                return Err(RestError::Api(ApiException::new(
                    ErrorCode::from_status(status.as_u16()),
                    message,
                )));
            }

            serde_json::from_slice::<Envelope<T>>(&bytes)
                .map_err(|err| RestError::Decode(err.to_string()))
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| RestError::Timeout(self.timeout))?
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RestError> {
        Ok(self.execute::<T>(request).await?.into_result()?)
    }

    async fn acknowledge(&self, request: RequestBuilder) -> Result<(), RestError> {
        Ok(self
            .execute::<serde_json::Value>(request)
            .await?
            .into_unit()?)
    }
}

#[async_trait]
impl PicstaApi for RestClient {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RestError> {
        self.fetch(self.http.get(self.url("/api/conversations")))
            .await
    }

    async fn create_conversation(
        &self,
        participant_ids: Vec<UserId>,
    ) -> Result<ConversationSummary, RestError> {
        self.fetch(
            self.http
                .post(self.url("/api/conversations"))
                .json(&CreateConversationRequest { participant_ids }),
        )
        .await
    }

    async fn hide_conversation(&self, conversation_id: &ConversationId) -> Result<(), RestError> {
        self.acknowledge(
            self.http
                .post(self.url(&format!("/api/conversations/{conversation_id}/hide"))),
        )
        .await
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), RestError> {
        self.acknowledge(
            self.http
                .post(self.url(&format!("/api/conversations/{conversation_id}/read"))),
        )
        .await
    }

    async fn unread_counts(&self) -> Result<UnreadCounts, RestError> {
        self.fetch(self.http.get(self.url("/api/conversations/unread")))
            .await
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<MessagePage, RestError> {
        debug!(conversation_id = %conversation_id, limit, "rest: fetching message page");
        self.fetch(
            self.http
                .get(self.url(&format!("/api/messages/{conversation_id}")))
                .query(&ListMessagesQuery {
                    limit: limit.clamp(1, 100),
                    before: before.map(|id| id.as_str()),
                }),
        )
        .await
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, RestError> {
        self.fetch(self.http.post(self.url("/api/messages")).json(request))
            .await
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, RestError> {
        self.fetch(self.http.get(self.url("/api/notifications")))
            .await
    }

    async fn mark_notifications_read(&self) -> Result<(), RestError> {
        self.acknowledge(self.http.put(self.url("/api/notifications/read")))
            .await
    }

    async fn delete_notification(
        &self,
        notification_id: &NotificationId,
    ) -> Result<(), RestError> {
        self.acknowledge(
            self.http
                .delete(self.url(&format!("/api/notifications/{notification_id}"))),
        )
        .await
    }

    async fn clear_notifications(&self) -> Result<(), RestError> {
        self.acknowledge(self.http.delete(self.url("/api/notifications")))
            .await
    }

    async fn toggle_like(&self, post_id: &PostId) -> Result<ToggleResponse, RestError> {
        self.fetch(self.http.post(self.url(&format!("/api/posts/{post_id}/like"))))
            .await
    }

    async fn toggle_save(&self, post_id: &PostId) -> Result<ToggleResponse, RestError> {
        self.fetch(self.http.post(self.url(&format!("/api/posts/{post_id}/save"))))
            .await
    }

    async fn toggle_follow(&self, user_id: &UserId) -> Result<ToggleResponse, RestError> {
        self.fetch(self.http.post(self.url(&format!("/api/users/{user_id}/follow"))))
            .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
