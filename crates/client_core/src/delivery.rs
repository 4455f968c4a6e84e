use std::collections::HashMap;

use shared::{
    domain::{ConversationId, MessageId, TempId},
    protocol::{MessageBody, SendMessageRequest},
};

use crate::error::DeliveryError;

/// `Pending -> Sent | Failed`, `Failed -> Pending` on retry. `Sent` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Pending,
    Sent(MessageId),
    Failed(String),
}

impl SendStatus {
    fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent(_) => "sent",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub temp_id: TempId,
    pub conversation_id: ConversationId,
    pub body: MessageBody,
    pub attempts: u32,
    pub status: SendStatus,
}

impl OutboundMessage {
    pub fn request(&self) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id: self.conversation_id.clone(),
            body: self.body.clone(),
            client_id: self.temp_id.clone(),
        }
    }
}

/// Local sends that have not reached a terminal state, keyed by temp id.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: HashMap<TempId, OutboundMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(
        &mut self,
        temp_id: TempId,
        conversation_id: ConversationId,
        body: MessageBody,
    ) -> &OutboundMessage {
        self.messages
            .entry(temp_id.clone())
            .or_insert(OutboundMessage {
                temp_id,
                conversation_id,
                body,
                attempts: 1,
                status: SendStatus::Pending,
            })
    }

    pub fn get(&self, temp_id: &TempId) -> Option<&OutboundMessage> {
        self.messages.get(temp_id)
    }

    pub fn mark_sent(&mut self, temp_id: &TempId, id: MessageId) -> Result<(), DeliveryError> {
        let message = self.pending_mut(temp_id, "confirm")?;
        message.status = SendStatus::Sent(id);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        temp_id: &TempId,
        reason: impl Into<String>,
    ) -> Result<(), DeliveryError> {
        let message = self.pending_mut(temp_id, "fail")?;
        message.status = SendStatus::Failed(reason.into());
        Ok(())
    }

    /// Moves a failed message back to pending and returns a copy to resend.
    pub fn begin_retry(&mut self, temp_id: &TempId) -> Result<OutboundMessage, DeliveryError> {
        let message = self
            .messages
            .get_mut(temp_id)
            .ok_or_else(|| DeliveryError::UnknownMessage(temp_id.clone()))?;
        if !matches!(message.status, SendStatus::Failed(_)) {
            return Err(DeliveryError::InvalidTransition {
                from: message.status.label(),
                action: "retry",
            });
        }
        message.status = SendStatus::Pending;
        message.attempts += 1;
        Ok(message.clone())
    }

    /// A canonical copy seen on the socket settles the send even after a
    /// failed REST attempt. Returns `false` when nothing changed.
    pub fn confirm_delivered(&mut self, temp_id: &TempId, id: MessageId) -> bool {
        match self.messages.get_mut(temp_id) {
            Some(message) if !matches!(message.status, SendStatus::Sent(_)) => {
                message.status = SendStatus::Sent(id);
                true
            }
            _ => false,
        }
    }

    /// Drops sent entries; their canonical rows live in the timeline.
    pub fn prune_sent(&mut self) -> usize {
        let before = self.messages.len();
        self.messages
            .retain(|_, message| !matches!(message.status, SendStatus::Sent(_)));
        before - self.messages.len()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn pending_mut(
        &mut self,
        temp_id: &TempId,
        action: &'static str,
    ) -> Result<&mut OutboundMessage, DeliveryError> {
        let message = self
            .messages
            .get_mut(temp_id)
            .ok_or_else(|| DeliveryError::UnknownMessage(temp_id.clone()))?;
        if message.status != SendStatus::Pending {
            return Err(DeliveryError::InvalidTransition {
                from: message.status.label(),
                action,
            });
        }
        Ok(message)
    }
}
