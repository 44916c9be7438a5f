//! # porchlight-core
//!
//! Core types and message routing for the Porchlight notification broker.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Topic** - Named channel with a subscriber set and a retained slot
//! - **Router** - Pub/sub fan-out to per-connection outboxes
//! - **BrokerEvent** - Connect, disconnect, subscribe and publish notifications
//! - **Publisher** - The narrow interface components use to emit messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Session    │────▶│   Router    │────▶│   Topic     │──▶ outboxes
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Listeners  │
//!                     └─────────────┘
//! ```

pub mod events;
pub mod message;
pub mod router;
pub mod topic;

pub use events::BrokerEvent;
pub use message::{Delivery, Message};
pub use router::{Publisher, Router, RouterConfig, RouterError, RouterStats};
pub use topic::{validate_topic_name, Outbox, Topic};
