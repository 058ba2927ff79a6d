//! Email channel — SMTP sending via async lettre.
//!
//! All message content types ship through this one transport; the type tags
//! only shape the payload upstream. Supports Gmail, Outlook, custom relays.

use async_trait::async_trait;
use lettre::{
    message::header::ContentType, message::Attachment, message::Mailbox, message::MultiPart,
    message::SinglePart, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message as LettreMessage, Tokio1Executor,
};

use vigil_core::config::SmtpConfig;
use vigil_core::error::{Result, VigilError};
use vigil_core::traits::ChannelSender;
use vigil_core::types::{SendOutcome, SendRequest};

/// SMTP-backed channel sender.
pub struct SmtpSender {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    /// Build the relay once at startup; a bad relay host is a fatal
    /// configuration error.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(VigilError::Config("SMTP credentials missing".into()));
        }
        let from = parse_mailbox(config.sender_address(), &config.from_name)?;
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| VigilError::Config(format!("SMTP relay: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();
        Ok(Self { from, mailer })
    }

    async fn build_email(&self, request: &SendRequest) -> Result<LettreMessage> {
        let to = parse_mailbox(&request.to_email, &request.to_name)?;
        let builder = LettreMessage::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&request.subject);

        if request.attachments.is_empty() {
            return builder
                .header(ContentType::TEXT_PLAIN)
                .body(request.body.clone())
                .map_err(|e| VigilError::Channel(format!("Build email: {e}")));
        }

        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(request.body.clone()));
        for attachment in &request.attachments {
            let bytes = tokio::fs::read(&attachment.location).await.map_err(|e| {
                VigilError::Channel(format!("Read attachment {}: {e}", attachment.location))
            })?;
            let content_type = ContentType::parse(&attachment.content_type)
                .unwrap_or(ContentType::TEXT_PLAIN);
            multipart =
                multipart.singlepart(Attachment::new(attachment.filename.clone()).body(bytes, content_type));
        }
        builder
            .multipart(multipart)
            .map_err(|e| VigilError::Channel(format!("Build email: {e}")))
    }
}

#[async_trait]
impl ChannelSender for SmtpSender {
    async fn send(&self, request: SendRequest) -> Result<SendOutcome> {
        let email = self.build_email(&request).await?;
        match self.mailer.send(email).await {
            Ok(response) => {
                tracing::info!("📤 Email sent to {}", request.to_email);
                Ok(SendOutcome::ok(response.first_line().map(String::from)))
            }
            Err(e) => Ok(SendOutcome::failed(format!("SMTP send: {e}"))),
        }
    }
}

fn parse_mailbox(email: &str, name: &str) -> Result<Mailbox> {
    let raw = if name.is_empty() {
        email.to_string()
    } else {
        format!("{name} <{email}>")
    };
    raw.parse()
        .map_err(|e| VigilError::Channel(format!("Invalid address '{email}': {e}")))
}
