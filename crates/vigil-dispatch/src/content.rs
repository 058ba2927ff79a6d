//! Content assembly — the type tags select how the payload is built, never
//! the transport. Email contributes the text body; video/voice/file
//! contribute attachments. Remote media is linked instead of attached.

use vigil_core::types::{Message, MessageAttachment, MessageType};

/// A rendered payload, ready to address to a recipient.
#[derive(Debug, Clone)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MessageAttachment>,
}

/// Assemble subject, body, and attachments from the message's type tags.
pub fn render(message: &Message) -> RenderedContent {
    let subject = if message.subject.is_empty() {
        "A message for you".to_string()
    } else {
        message.subject.clone()
    };

    let mut body = message.body.clone();
    let mut attachments = Vec::new();

    let has_media = message
        .types
        .iter()
        .any(|t| matches!(t, MessageType::Video | MessageType::Voice | MessageType::File));
    if has_media {
        let mut links = Vec::new();
        for attachment in &message.attachments {
            if is_remote(&attachment.location) {
                links.push(format!("{}: {}", attachment.filename, attachment.location));
            } else {
                attachments.push(attachment.clone());
            }
        }
        if !links.is_empty() {
            body.push_str("\n\nAttached media:\n");
            for link in links {
                body.push_str(&link);
                body.push('\n');
            }
        }
    }

    RenderedContent { subject, body, attachments }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}
