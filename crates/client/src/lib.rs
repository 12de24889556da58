//! Client library for tracking asynchronous image-generation jobs.
//!
//! A picture-book generation request is submitted over HTTP, then
//! tracked through a real-time WebSocket channel with a polling
//! fallback. [`tracker::JobTracker`] owns the lifecycle of one active
//! job at a time: submission, push/pull progress delivery, persistence
//! across restarts, and idempotent teardown.

pub mod channel;
pub mod config;
pub mod messages;
pub mod queue;
pub mod reconnect;
pub mod store;
pub mod tracker;
