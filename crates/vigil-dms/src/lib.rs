//! # Vigil DMS
//!
//! The Dead Man's Switch cycle engine: a deadline/grace/release state
//! machine gated by periodic user check-ins.
//!
//! ## State machine
//! ```text
//! Active ──deadline──▶ Grace ──grace lapses──▶ PendingRelease ──▶ Released (terminal)
//!   ▲  ▲                 │                          │
//!   │  └──── check-in ───┘                          └─▶ release event → dispatcher
//!   │
//! Paused (countdown frozen; resume restores remaining time)
//! ```
//!
//! Pure deadline math lives in [`cycle`]; [`engine::DmsEngine`] wraps it
//! with store CAS, reminders, and the one-shot release event.

pub mod cycle;
pub mod engine;

pub use engine::DmsEngine;
