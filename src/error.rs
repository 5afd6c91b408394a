use thiserror::Error;
use uuid::Uuid;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    AccessDenied(String),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn message_not_found(id: Uuid) -> Self {
        ChatError::NotFound(format!("message {id}"))
    }

    /// Text safe to hand back to a client. Store internals stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Persistence(_) => "could not reach the message store, try again".to_owned(),
            other => other.to_string(),
        }
    }
}
