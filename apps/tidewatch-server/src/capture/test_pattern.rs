use std::time::Duration;

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CaptureConfig, CaptureDevice, CaptureSource, DeviceError, FrameReceiver, RawFrame};

/// Synthetic camera producing a moving gradient at the configured rate.
///
/// Frames are paced by tokio's clock, so under a paused test runtime a
/// five-second recording completes instantly and deterministically.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestPatternSource;

impl CaptureSource for TestPatternSource {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if config.fps == 0 || config.width == 0 || config.height == 0 {
            return Err(DeviceError::Open(format!(
                "unsupported mode {}x{} @ {}fps",
                config.width, config.height, config.fps
            )));
        }
        Ok(Box::new(TestPatternDevice {
            config: *config,
            stop: CancellationToken::new(),
            task: None,
        }))
    }
}

struct TestPatternDevice {
    config: CaptureConfig,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl CaptureDevice for TestPatternDevice {
    async fn start(&mut self) -> Result<FrameReceiver, DeviceError> {
        if self.task.is_some() {
            return Err(DeviceError::Open("test pattern already started".into()));
        }
        let (tx, rx) = mpsc::channel(self.config.fps as usize);
        let config = self.config;
        let stop = self.stop.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_nanos(
                1_000_000_000 / u64::from(config.fps),
            ));
            let mut frame_num = 0u64;
            info!(
                width = config.width,
                height = config.height,
                fps = config.fps,
                "test pattern started"
            );
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let frame = gradient(&config, frame_num);
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
                frame_num += 1;
            }
            debug!(frames = frame_num, "test pattern stopped");
        }));
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|err| DeviceError::Stream(format!("test pattern task failed: {err}")))?;
        }
        Ok(())
    }
}

fn gradient(config: &CaptureConfig, frame_num: u64) -> RawFrame {
    let (width, height) = (config.width, config.height);
    let shift = (frame_num * 4 % 256) as u32;
    let mut rgb = Vec::with_capacity(config.frame_len());
    for y in 0..height {
        for x in 0..width {
            rgb.push(((x * 255 / width.max(1) + shift) % 256) as u8);
            rgb.push(((y * 255 / height.max(1)) % 256) as u8);
            rgb.push((shift ^ 0x80) as u8);
        }
    }
    RawFrame { width, height, rgb }
}
