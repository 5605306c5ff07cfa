use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::registry::redact_url;
use super::{Frame, VideoSource, VideoSourceFactory};
use crate::config::CaptureConfig;
use gatewatch_common::CameraConfig;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens streams by piping them through an `ffmpeg` child process that emits
/// raw BGR24 frames at a fixed size.
pub struct FfmpegSourceFactory {
    ffmpeg_path: String,
    width: u32,
    height: u32,
}

impl FfmpegSourceFactory {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            width: config.width,
            height: config.height,
        }
    }

    fn build_command(&self, url: &str) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.args(["-i", url])
            .args([
                "-vf",
                &format!("scale={}:{}", self.width, self.height),
                "-pix_fmt",
                "bgr24",
                "-f",
                "rawvideo",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl VideoSourceFactory for FfmpegSourceFactory {
    async fn open(&self, config: &CameraConfig) -> Result<Box<dyn VideoSource>> {
        info!(camera = %config.code, "Opening stream {}", redact_url(&config.stream_url));

        let mut child = self
            .build_command(&config.stream_url)
            .spawn()
            .context("failed to spawn ffmpeg")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;

        let mut source = FfmpegSource {
            child: Some(child),
            reader: BufReader::new(stdout),
            buffer: vec![0; Frame::byte_len(self.width, self.height)],
            width: self.width,
            height: self.height,
            has_frame: false,
        };

        // An unreachable stream never produces a first frame.
        match tokio::time::timeout(OPEN_TIMEOUT, source.grab()).await {
            Ok(true) => Ok(Box::new(source)),
            Ok(false) => {
                source.release().await;
                Err(anyhow!("stream ended before the first frame"))
            }
            Err(_) => {
                source.release().await;
                Err(anyhow!("no frame within {:?}", OPEN_TIMEOUT))
            }
        }
    }
}

pub struct FfmpegSource {
    child: Option<Child>,
    reader: BufReader<ChildStdout>,
    buffer: Vec<u8>,
    width: u32,
    height: u32,
    has_frame: bool,
}

#[async_trait]
impl VideoSource for FfmpegSource {
    async fn grab(&mut self) -> bool {
        match self.reader.read_exact(&mut self.buffer).await {
            Ok(_) => {
                self.has_frame = true;
                true
            }
            Err(e) => {
                debug!("ffmpeg read failed: {}", e);
                self.has_frame = false;
                false
            }
        }
    }

    async fn retrieve(&mut self) -> Option<Frame> {
        if !self.has_frame {
            return None;
        }
        Some(Frame::new(self.buffer.clone(), self.width, self.height))
    }

    async fn release(&mut self) {
        self.has_frame = false;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop ffmpeg process: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtsp_streams_are_forced_to_tcp() {
        let factory = FfmpegSourceFactory::new(&CaptureConfig::default());
        let cmd = factory.build_command("rtsp://10.0.0.5/live");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w[0] == "-rtsp_transport" && w[1] == "tcp"));
        assert!(args.contains(&"scale=1280:720".to_string()));

        let cmd = factory.build_command("http://10.0.0.5/mjpeg");
        assert!(!cmd.as_std().get_args().any(|a| a == "-rtsp_transport"));
    }
}
