use crate::domain::UserId;

/// Core error type.
///
/// Adapter crates map their failures into this type so the worker loop can
/// tell user-facing problems (reply and continue) from transport loss (exit).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("delivery to {recipient} failed: {reason}")]
    DeliveryFailed { recipient: UserId, reason: String },

    #[error(transparent)]
    InvalidIntent(#[from] InvalidIntent),

    #[error("unauthorized")]
    Unauthorized,

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn delivery(recipient: &UserId, reason: impl Into<String>) -> Self {
        Error::DeliveryFailed {
            recipient: recipient.clone(),
            reason: reason.into(),
        }
    }
}

/// A well-formed request the graph refuses.
///
/// The `Display` text is sent back to the requester verbatim.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidIntent {
    #[error("you can't follow yourself")]
    SelfFollow,

    #[error("you can't invite yourself")]
    SelfInvite,

    #[error("you can't block yourself")]
    SelfBlock,

    #[error("{0} hasn't invited you. ask them to /invite you, or /follow {0}")]
    NoPendingInvite(UserId),

    #[error("'{0}' is already taken, use /name to pick a different name")]
    NameTaken(String),

    #[error("'{0}' can't be used as a name. names are 1-32 characters with no spaces")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, Error>;
