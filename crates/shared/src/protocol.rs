use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConversationId, ConversationKind, MessageId, NotificationId, NotificationKind, PostId,
        TempId, UserId,
    },
    error::{ApiError, ApiException, ErrorCode},
};

/// Response wrapper used by every REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<T, ApiException> {
        if !self.success {
            return Err(ApiException::new(
                ErrorCode::Internal,
                self.message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ));
        }
        self.data
            .ok_or_else(|| ApiException::new(ErrorCode::Internal, "response envelope has no data"))
    }

    /// Like [`Envelope::into_result`] for endpoints that acknowledge without a body.
    pub fn into_unit(self) -> Result<(), ApiException> {
        if self.success {
            Ok(())
        } else {
            Err(ApiException::new(
                ErrorCode::Internal,
                self.message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    SharedPost {
        post_id: PostId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(flatten)]
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<TempId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageId>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: UserId,
    pub actor_id: UserId,
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<PostId>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    #[serde(default)]
    pub conversations: HashMap<ConversationId, u32>,
    #[serde(default)]
    pub notifications: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub body: MessageBody,
    pub client_id: TempId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub participant_ids: Vec<UserId>,
}

/// Server answer to like/save/follow toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinChat { conversation_id: ConversationId },
    LeaveChat { conversation_id: ConversationId },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
    },
    MessageAck {
        client_id: TempId,
        message: Message,
    },
    MessagesDeleted {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    ChatUpdated {
        conversation: ConversationSummary,
    },
    NewNotification {
        notification: Notification,
    },
    Pong,
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_frames_use_event_and_data_keys() {
        let frame = serde_json::to_value(ClientRequest::JoinChat {
            conversation_id: ConversationId::from("c1"),
        })
        .expect("json");
        assert_eq!(
            frame,
            serde_json::json!({"event": "join_chat", "data": {"conversation_id": "c1"}})
        );

        let ping = serde_json::to_value(ClientRequest::Ping).expect("json");
        assert_eq!(ping, serde_json::json!({"event": "ping"}));
    }

    #[test]
    fn new_message_event_parses_flattened_body() {
        let raw = r#"{
            "event": "new_message",
            "data": {"message": {
                "id": "m1",
                "conversation_id": "c1",
                "sender_id": "u2",
                "kind": "shared_post",
                "post_id": "p9",
                "created_at": "2024-01-01T00:00:00Z",
                "client_id": "tmp-1"
            }}
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("parse");
        let ServerEvent::NewMessage { message } = event else {
            panic!("unexpected event");
        };
        assert_eq!(
            message.body,
            MessageBody::SharedPost {
                post_id: PostId::from("p9"),
                caption: None,
            }
        );
        assert_eq!(message.client_id, Some(TempId::from("tmp-1")));
    }

    #[test]
    fn failed_envelope_carries_server_message() {
        let envelope: Envelope<MessagePage> =
            serde_json::from_str(r#"{"success": false, "message": "conversation not found"}"#)
                .expect("parse");
        let err = envelope.into_result().expect_err("must fail");
        assert_eq!(err.message, "conversation not found");
    }

    #[test]
    fn acknowledgement_envelope_without_data_is_ok_as_unit() {
        let envelope: Envelope<serde_json::Value> =
            serde_json::from_str(r#"{"success": true}"#).expect("parse");
        assert!(envelope.into_unit().is_ok());
    }

    #[test]
    fn envelope_parses_payloads_without_a_default() {
        let raw = r#"{
            "success": true,
            "data": {
                "id": "m1",
                "conversation_id": "c1",
                "sender_id": "u2",
                "kind": "text",
                "text": "hi",
                "created_at": "2024-01-01T00:00:00Z"
            }
        }"#;
        let envelope: Envelope<Message> = serde_json::from_str(raw).expect("parse");
        let message = envelope.into_result().expect("data");
        assert_eq!(message.id, MessageId::from("m1"));

        let empty: Envelope<Message> =
            serde_json::from_str(r#"{"success": true}"#).expect("parse");
        assert!(empty.data.is_none());
    }
}
