//! # taskflow-rs
//!
//! Sequential task flows: enqueue units of work that run one at a time, in
//! a controllable order, on either a dedicated background loop or a
//! host-provided main dispatcher.
//!
//! Provides reorderable work queues (front, behind, front-of), pause and
//! resume, cancellation, lifecycle listeners, a shared payload slot, and
//! tracing/OpenTelemetry observability.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod task;
pub mod telemetry;
