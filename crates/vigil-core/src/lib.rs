//! # Vigil Core
//!
//! Shared data model, error taxonomy, configuration, and the collaborator
//! traits (stores, channel sender, recipient directory, clock) consumed by
//! the DMS cycle engine and the scheduled dispatcher.

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{ManualClock, SystemClock};
pub use config::VigilConfig;
pub use error::{Result, VigilError};
pub use traits::{
    ChannelSender, Clock, ConfigStore, DeliveryStore, MessageStore, RecipientDirectory,
};
pub use types::{
    Contact, CycleState, DeliveryRecord, DeliveryState, DmsChannels, DmsConfig, DmsCycle,
    DmsSettings, DmsStatus, Message, MessageAttachment, MessageScope, MessageStatus,
    MessageType, ReleaseEvent, SendOutcome, SendRequest, TimeSpan, TimeUnit,
};
