#![forbid(unsafe_code)]

//! Building blocks for mirroring YouTube channels into a MediaCMS instance.
//!
//! The `mirror_channels` binary wires these together: discovery resolves the
//! video list, the pipeline downloads and uploads with bounded worker pools,
//! and the orchestrator persists per-channel sync state between runs.

pub mod config;
pub mod discovery;
pub mod encoding;
pub mod error;
pub mod mediacms;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod render;
pub mod retry;
pub mod security;
pub mod shutdown;
pub mod source;
pub mod staging;
pub mod state;
pub mod status;
