//! Invalidation messages as carried on the log.

use std::fmt;

use thiserror::Error;

use crate::cache::StreamMessage;

pub const FIELD_TYPE: &str = "type";
pub const FIELD_RESOURCE: &str = "resource";

/// Mutation announced by a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Updated,
    Deleted,
    /// Any type this consumer does not act on.
    Other(String),
}

impl MessageKind {
    /// Parse a type name. Qualified names (`ns.Updated`, `ns#Deleted`) are
    /// matched on their last segment.
    pub fn parse(raw: &str) -> Self {
        let name = raw
            .rsplit(['.', '#', '/'])
            .next()
            .unwrap_or(raw)
            .trim();
        match name {
            "Updated" => MessageKind::Updated,
            "Deleted" => MessageKind::Deleted,
            _ => MessageKind::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Updated => "Updated",
            MessageKind::Deleted => "Deleted",
            MessageKind::Other(raw) => raw,
        }
    }

    /// Whether cached entries of the resource must be evicted.
    pub fn invalidates(&self) -> bool {
        matches!(self, MessageKind::Updated | MessageKind::Deleted)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message {id} lacks the `{field}` field")]
    MissingField { id: String, field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub id: String,
    pub kind: MessageKind,
    pub resource: String,
}

impl TryFrom<&StreamMessage> for InvalidationMessage {
    type Error = MessageError;

    fn try_from(message: &StreamMessage) -> Result<Self, Self::Error> {
        let missing = |field| MessageError::MissingField {
            id: message.id.clone(),
            field,
        };
        let kind = message
            .field(FIELD_TYPE)
            .map(MessageKind::parse)
            .ok_or_else(|| missing(FIELD_TYPE))?;
        let resource = message
            .field(FIELD_RESOURCE)
            .map(str::trim)
            .filter(|resource| !resource.is_empty())
            .ok_or_else(|| missing(FIELD_RESOURCE))?;

        Ok(Self {
            id: message.id.clone(),
            kind,
            resource: resource.to_string(),
        })
    }
}
