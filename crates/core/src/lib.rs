//! Shared domain types for the storyweave picture-book platform.
//!
//! Holds the job lifecycle types (status, snapshots, generation
//! requests) consumed by the client crate and any future service
//! crates.

pub mod job;

pub use job::{GenerationRequest, JobSnapshot, JobStatus, PageKind, QueueStats};
