//! # braid
//!
//! Durable workflow execution engine: long-lived, resumable processes
//! composed of step trees, with at-least-once execution, retries, sagas,
//! parallel branches, and event-driven suspension.
//!
//! The executor runs one iteration per call over an instance's runnable
//! pointers; hosts own the dequeue loop, the distributed lock, and
//! persistence of the returned subscriptions and errors. Reference
//! in-memory providers live in [`providers::memory`].

pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod executor;
pub mod model;
pub mod providers;
pub mod registry;
pub mod steps;
pub mod telemetry;

pub use error::{Error, Result};
