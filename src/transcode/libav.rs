use crate::core::config::TranscodeConfig;
use crate::core::error::RelayError;
use crate::transcode::TranscodeSink;

/// In-process libav backend stub.
///
/// The default build ships without FFmpeg library bindings; `libav` stays a
/// recognized backend name so configs validate, but constructing it reports
/// that the binding-enabled build is required.
pub fn new_backend(
    _cfg: &TranscodeConfig,
    _upstream: &str,
) -> Result<Box<dyn TranscodeSink>, RelayError> {
    Err(RelayError::Config(
        "libav backend not enabled in this build; use backend \"ffmpeg\"".into(),
    ))
}
