use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;
use tokio::process::{Child, ChildStdin, Command};
use tracing::info;

use crate::core::config::TranscodeConfig;
use crate::core::error::RelayError;
use crate::transcode::gop::gop_args;
use crate::transcode::TranscodeSink;

const DEFAULT_VIDEO_CODEC: &str = "libx264";
const DEFAULT_AUDIO_CODEC: &str = "aac";

/// External FFmpeg process consuming FLV on stdin and pushing the encoded
/// stream to the upstream URL.
pub struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl FfmpegSink {
    pub fn spawn(cfg: &TranscodeConfig, upstream: &str) -> Result<Self, RelayError> {
        let video_codec = if cfg.video_codec.is_empty() {
            DEFAULT_VIDEO_CODEC
        } else {
            &cfg.video_codec
        };
        let audio_codec = if cfg.audio_codec.is_empty() {
            DEFAULT_AUDIO_CODEC
        } else {
            &cfg.audio_codec
        };

        let mut args: Vec<String> = vec![
            "-re".into(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            video_codec.into(),
            "-c:a".into(),
            audio_codec.into(),
        ];
        if !cfg.preset.is_empty() {
            args.push("-preset".into());
            args.push(cfg.preset.clone());
        }
        if cfg.crf > 0 {
            args.push("-crf".into());
            args.push(cfg.crf.to_string());
        }
        args.extend(gop_args(&cfg.gop)?);
        args.push("-f".into());
        args.push("flv".into());
        args.push(upstream.to_string());

        info!(args = %args.join(" "), "starting ffmpeg");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Config(format!("start ffmpeg: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::Config("ffmpeg stdin pipe unavailable".into()))?;

        Ok(Self {
            child,
            stdin: Some(stdin),
        })
    }
}

impl AsyncWrite for FfmpegSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "ffmpeg stdin closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl TranscodeSink for FfmpegSink {
    /// Close stdin (signalling EOF to the encoder) and wait for it to exit.
    fn close(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send>> {
        Box::pin(async move {
            drop(self.stdin.take());
            let status = self.child.wait().await?;
            if status.success() {
                Ok(())
            } else {
                Err(RelayError::Config(format!(
                    "ffmpeg exited with status {status}"
                )))
            }
        })
    }
}
