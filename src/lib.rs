//! # Tally Core - Accounting Policy Engine
//!
//! Rust implementation of a batch scheduler's accounting-policy enforcement
//! core providing:
//! - Declarative limits on accounts (associations) and QoS classes
//! - Live usage counters maintained across the job lifecycle
//! - Admission validation with QoS/association precedence
//! - Pre-/post-selection runnability checks and timeout evaluation
//!
//! ## Architecture
//!
//! A single [`policy::PolicyEngine`] handle owns all shared state behind a
//! four-slot reader/writer lock bundle:
//! ```text
//!   lifecycle events →  ┌─────────────────────────────────┐
//!   (submit, begin,     │          PolicyEngine           │
//!    finish, alter)     │  ┌────────┐ ┌─────┐ ┌───────┐   │
//!                       │  │ Assocs │ │ QoS │ │ Users │   │
//!   decisions    ←      │  └────────┘ └─────┘ └───────┘   │
//!   (run / hold /       │  ┌──────┐                       │
//!    reject / timeout)  │  │ TRES │   RwLock per table    │
//!                       │  └──────┘                       │
//!                       └─────────────────────────────────┘
//! ```
//!
//! Job records stay owned by the scheduler and are passed into every
//! operation; persistence, priority math, and job execution are external
//! collaborators reached through the [`hooks`] traits.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod hooks;
pub mod policy;
pub mod tres;
pub mod types;

// Internal utilities
pub mod observability;

pub use policy::PolicyEngine;
pub use types::{Config, EnforceConfig, Error, Result};
