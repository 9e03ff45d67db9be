//! streamrelay: a transparent RTMP/RTMPS relay for live-video ingest.
//!
//! Publishing encoders connect to the listener, are authenticated during the
//! RTMP `connect` exchange, and have their traffic pumped byte-for-byte to a
//! healthy upstream, or reframed into FLV for an external encoder when the
//! transcode path is enabled.

pub mod core;
pub mod observability;
pub mod relay;
pub mod resilience;
pub mod rtmp;
pub mod transcode;
