//! Console channel — logs instead of sending. Used for dry runs and local
//! development when no SMTP relay is configured.

use async_trait::async_trait;

use vigil_core::error::Result;
use vigil_core::traits::ChannelSender;
use vigil_core::types::{SendOutcome, SendRequest};

#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSender;

#[async_trait]
impl ChannelSender for ConsoleSender {
    async fn send(&self, request: SendRequest) -> Result<SendOutcome> {
        tracing::info!(
            "📢 [dry-run] To: {} <{}> | Subject: {} | {} attachment(s)",
            request.to_name,
            request.to_email,
            request.subject,
            request.attachments.len()
        );
        Ok(SendOutcome::ok(None))
    }
}
