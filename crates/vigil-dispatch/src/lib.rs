//! # Vigil Dispatch
//!
//! The polling engine that turns due messages — user-scheduled or
//! DMS-released — into per-recipient delivery attempts with status
//! tracking.
//!
//! ## Tick pipeline
//! ```text
//! interval tick
//!   ├── DmsEngine.poll() → release events → promote Draft → Scheduled("now")
//!   ├── list_due_messages(now)            (catch-up: overdue still fires)
//!   ├── claim (conditional update)        (loser skips silently)
//!   ├── per-recipient fan-out             (Pending → Delivered/Failed)
//!   └── finalize                          (any success ⇒ Sent, else Failed)
//! ```
//!
//! Dispatch is at-least-once: a failed finalize is retried on the next tick
//! and may duplicate sends.

pub mod content;
pub mod delivery;
pub mod dispatcher;

pub use content::{render, RenderedContent};
pub use delivery::{DeliverySummary, DeliveryTracker};
pub use dispatcher::ScheduledDispatcher;
