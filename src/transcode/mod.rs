//! Transcoding passthrough: inbound RTMP is reframed to FLV and streamed
//! into an external encoder that pushes the result upstream.

pub mod ffmpeg;
pub mod gop;
pub mod libav;

use std::future::Future;
use std::pin::Pin;

use tokio::io::AsyncWrite;

use crate::core::config::TranscodeConfig;
use crate::core::error::RelayError;

pub const BACKEND_FFMPEG: &str = "ffmpeg";
pub const BACKEND_LIBAV: &str = "libav";

/// A writable byte sink in front of an encoder.
///
/// FLV bytes go in via `AsyncWrite`; [`TranscodeSink::close`] flushes,
/// closes the input and waits for the consumer to finish.
pub trait TranscodeSink: AsyncWrite + Unpin + Send {
    fn close(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send>>;
}

/// Map the configured backend name to a known backend; empty means ffmpeg.
pub fn resolve_backend(cfg: &TranscodeConfig) -> Result<&'static str, RelayError> {
    match cfg.backend.trim().to_ascii_lowercase().as_str() {
        "" | BACKEND_FFMPEG => Ok(BACKEND_FFMPEG),
        BACKEND_LIBAV => Ok(BACKEND_LIBAV),
        other => Err(RelayError::Config(format!(
            "unknown transcode backend: {other}"
        ))),
    }
}

/// Start the configured backend pushing to `upstream`.
pub fn new_sink(
    cfg: &TranscodeConfig,
    upstream: &str,
) -> Result<Box<dyn TranscodeSink>, RelayError> {
    match resolve_backend(cfg)? {
        BACKEND_LIBAV => libav::new_backend(cfg, upstream),
        _ => Ok(Box::new(ffmpeg::FfmpegSink::spawn(cfg, upstream)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(backend: &str) -> TranscodeConfig {
        TranscodeConfig {
            enabled: true,
            backend: backend.to_string(),
            ..TranscodeConfig::default()
        }
    }

    #[test]
    fn test_backend_resolution() {
        assert_eq!(resolve_backend(&cfg("")).unwrap(), BACKEND_FFMPEG);
        assert_eq!(resolve_backend(&cfg("ffmpeg")).unwrap(), BACKEND_FFMPEG);
        assert_eq!(resolve_backend(&cfg("FFmpeg")).unwrap(), BACKEND_FFMPEG);
        assert_eq!(resolve_backend(&cfg("libav")).unwrap(), BACKEND_LIBAV);
        assert!(resolve_backend(&cfg("gstreamer")).is_err());
    }
}
