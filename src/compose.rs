use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, AppResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    NotImplemented,
}

impl OutgoingMessage {
    pub fn validate(&self) -> AppResult<()> {
        let to = self.to.trim();
        if to.is_empty() {
            return Err(AppError::Validation("recipient is required".into()));
        }
        if !to.contains('@') {
            return Err(AppError::Validation(format!(
                "recipient {to:?} is not an email address"
            )));
        }
        Ok(())
    }
}

pub fn submit(message: &OutgoingMessage) -> AppResult<SendOutcome> {
    message.validate()?;
    info!(
        to = %message.to.trim(),
        subject_len = message.subject.len(),
        body_len = message.body.len(),
        "Sending is not implemented; message discarded"
    );
    Ok(SendOutcome::NotImplemented)
}
