//! # Vigil Channels
//! Outbound delivery channel implementations behind the `ChannelSender` seam.

pub mod console;
pub mod email;

pub use console::ConsoleSender;
pub use email::SmtpSender;
