#![forbid(unsafe_code)]

// Lancast library - LAN screen-sharing host: rooms, signaling, peer orchestration

pub mod bitrate;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod metrics;
pub mod peer;
pub mod room;
pub mod signaling;
