use std::sync::Arc;

use crate::{
    config::Config,
    error::{ChatError, ChatResult},
};

pub struct JoinRequest<'a> {
    pub room_name: &'a str,
    pub username: &'a str,
    pub passkey: Option<&'a str>,
}

/// Decides whether a join may proceed. Evaluated before any membership
/// change.
pub trait JoinPolicy: Send + Sync {
    fn admit(&self, request: &JoinRequest<'_>) -> ChatResult<()>;
}

pub struct OpenPolicy;

impl JoinPolicy for OpenPolicy {
    fn admit(&self, _request: &JoinRequest<'_>) -> ChatResult<()> {
        Ok(())
    }
}

/// One shared secret for every room.
pub struct PasskeyPolicy {
    passkey: String,
}

impl PasskeyPolicy {
    pub fn new(passkey: impl Into<String>) -> Self {
        Self {
            passkey: passkey.into(),
        }
    }
}

impl JoinPolicy for PasskeyPolicy {
    fn admit(&self, request: &JoinRequest<'_>) -> ChatResult<()> {
        match request.passkey {
            Some(given) if given == self.passkey => Ok(()),
            _ => Err(ChatError::AccessDenied(format!(
                "wrong passkey for room {}",
                request.room_name
            ))),
        }
    }
}

pub fn from_config(config: &Config) -> Arc<dyn JoinPolicy> {
    match &config.room_passkey {
        Some(passkey) => Arc::new(PasskeyPolicy::new(passkey.clone())),
        None => Arc::new(OpenPolicy),
    }
}
