use crate::domain::UserId;

/// One inbound message from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sender: UserId,
    pub text: String,
    /// Milliseconds since the unix epoch, as stamped by the sender's client.
    pub timestamp: i64,
    /// Set for group messages; the router ignores those.
    pub group_id: Option<String>,
}

impl Envelope {
    pub fn direct(sender: UserId, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sender,
            text: text.into(),
            timestamp,
            group_id: None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }
}

/// One message to deliver to one recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient: UserId,
    pub text: String,
    /// Ties retries of the same logical delivery together in the logs.
    pub correlation_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(recipient: UserId, text: impl Into<String>) -> Self {
        Self {
            recipient,
            text: text.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}
