use shared::{
    domain::{ConversationId, MessageId, PostId, TempId, UserId},
    protocol::Notification,
};

use crate::connection::ConnectionState;

/// Typed events published by [`crate::MessagingClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    TimelineChanged {
        conversation_id: ConversationId,
    },
    MessageSent {
        conversation_id: ConversationId,
        temp_id: TempId,
        message_id: MessageId,
    },
    SendFailed {
        conversation_id: ConversationId,
        temp_id: TempId,
        reason: String,
    },
    UnreadChanged {
        conversation_id: Option<ConversationId>,
        total: u64,
    },
    NotificationReceived(Notification),
    NotificationsChanged {
        unread: u32,
    },
    InboxChanged,
    PostUpdated {
        post_id: PostId,
        liked: Option<bool>,
        saved: Option<bool>,
        like_count: Option<u64>,
    },
    UserFollowUpdated {
        user_id: UserId,
        following: bool,
    },
    ConnectionChanged(ConnectionState),
    Error(String),
}
