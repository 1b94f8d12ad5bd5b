use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{CaptureConfig, CaptureDevice, CaptureSource, DeviceError, FrameReceiver, RawFrame};

const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Camera read through an `ffmpeg` child process that writes raw RGB24 frames
/// to its stdout.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    input: String,
    binary: String,
}

impl FfmpegSource {
    /// `input` is handed to `-i` verbatim, e.g. `/dev/video0` on Linux,
    /// `0` on macOS or `video=Integrated Camera` on Windows.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            binary: "ffmpeg".into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    fn input_format() -> &'static str {
        if cfg!(target_os = "macos") {
            "avfoundation"
        } else if cfg!(target_os = "windows") {
            "dshow"
        } else {
            "v4l2"
        }
    }

    fn args(&self, config: &CaptureConfig) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            Self::input_format().into(),
            "-framerate".into(),
            config.fps.to_string(),
            "-video_size".into(),
            format!("{}x{}", config.width, config.height),
            "-i".into(),
            self.input.clone(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-".into(),
        ]
    }
}

impl CaptureSource for FfmpegSource {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if self.input.trim().is_empty() {
            return Err(DeviceError::NotFound("ffmpeg input is empty".into()));
        }
        Ok(Box::new(FfmpegDevice {
            binary: self.binary.clone(),
            args: self.args(config),
            config: *config,
            child: None,
            reader: None,
        }))
    }
}

struct FfmpegDevice {
    binary: String,
    args: Vec<String>,
    config: CaptureConfig,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl FfmpegDevice {
    async fn read_frame(
        stdout: &mut ChildStdout,
        config: &CaptureConfig,
    ) -> io::Result<RawFrame> {
        let mut rgb = vec![0u8; config.frame_len()];
        stdout.read_exact(&mut rgb).await?;
        Ok(RawFrame {
            width: config.width,
            height: config.height,
            rgb,
        })
    }
}

#[async_trait]
impl CaptureDevice for FfmpegDevice {
    async fn start(&mut self) -> Result<FrameReceiver, DeviceError> {
        info!(
            binary = %self.binary,
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
            "starting ffmpeg capture"
        );
        debug!(args = ?self.args, "ffmpeg args");

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => {
                    DeviceError::NotFound(format!("{} is not installed", self.binary))
                }
                _ => DeviceError::Open(err.to_string()),
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Open("ffmpeg stdout was not captured".into()))?;

        // The device only counts as live once it has produced a frame.
        let first = match tokio::time::timeout(
            FIRST_FRAME_TIMEOUT,
            Self::read_frame(&mut stdout, &self.config),
        )
        .await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                let _ = child.kill().await;
                return Err(DeviceError::Open(format!("ffmpeg produced no frames: {err}")));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(DeviceError::Open("timed out waiting for the first frame".into()));
            }
        };

        let (tx, rx) = mpsc::channel(self.config.fps as usize);
        let config = self.config;
        self.reader = Some(tokio::spawn(async move {
            if tx.send(Ok(first)).await.is_err() {
                return;
            }
            let mut delivered = 1u64;
            loop {
                match Self::read_frame(&mut stdout, &config).await {
                    Ok(frame) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                        delivered += 1;
                    }
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                        debug!(frames = delivered, "ffmpeg stream ended");
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(DeviceError::Io(err))).await;
                        break;
                    }
                }
            }
        }));
        self.child = Some(child);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        if let Some(mut child) = self.child.take() {
            info!("stopping ffmpeg capture");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill ffmpeg");
                return Err(DeviceError::Io(err));
            }
        }
        Ok(())
    }
}
