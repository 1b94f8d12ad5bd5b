//! Frame batch producer.
//!
//! A [`Recorder`] holds the per-connection state machine
//! (`Idle -> Recording -> [Cancelling] -> Flushing -> Idle`). [`run_recording`]
//! drives one session: it starts the device, buffers encoded frames until the
//! target count is reached or the session is cancelled, then releases the
//! device and ships the buffer as `video_start`, `video_batch`* and
//! `video_end`.

use std::{fmt, sync::Arc, time::Duration};

use metrics::counter;
use parking_lot::Mutex;
use tidewatch_proto::{
    FrameData, ServerEvent, Status, CAPTURE_FPS, FRAME_BATCH_SIZE, JPEG_QUALITY,
    MAX_RECORDING_SECS, MIN_RECORDING_SECS,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    capture::{encode_jpeg_base64, CaptureDevice, DeviceError, FrameReceiver},
    connection::{Connection, TransportError},
    error::CommandError,
};

/// How often the driver checks the frame buffer against the target.
pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause between two `video_batch` envelopes.
pub const INTER_BATCH_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Cancelling,
    Flushing,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecorderState::Idle => "idle",
            RecorderState::Recording => "recording",
            RecorderState::Cancelling => "cancelling",
            RecorderState::Flushing => "flushing",
        };
        f.write_str(name)
    }
}

/// Validated `start_cam` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingDuration(u32);

impl RecordingDuration {
    pub fn parse(arg: &str) -> Result<Self, CommandError> {
        arg.trim()
            .parse::<u32>()
            .ok()
            .filter(|secs| (MIN_RECORDING_SECS..=MAX_RECORDING_SECS).contains(secs))
            .map(Self)
            .ok_or_else(CommandError::invalid_duration)
    }

    pub fn secs(self) -> u32 {
        self.0
    }

    pub fn target_frames(self) -> usize {
        self.0 as usize * CAPTURE_FPS as usize
    }
}

#[derive(Debug)]
struct Slot {
    state: RecorderState,
    cancel: Option<CancellationToken>,
}

/// Recording state for one connection.
#[derive(Debug)]
pub struct Recorder {
    slot: Mutex<Slot>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: RecorderState::Idle,
                cancel: None,
            }),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.slot.lock().state
    }

    /// Claims the recorder. The session is cancelled when `lifetime` is.
    pub fn begin(
        self: &Arc<Self>,
        lifetime: &CancellationToken,
    ) -> Result<RecordingTicket, CommandError> {
        let mut slot = self.slot.lock();
        if slot.state != RecorderState::Idle {
            return Err(CommandError::AlreadyActive);
        }
        let cancel = lifetime.child_token();
        slot.state = RecorderState::Recording;
        slot.cancel = Some(cancel.clone());
        Ok(RecordingTicket {
            recorder: Arc::clone(self),
            cancel,
        })
    }

    /// Requests cooperative cancellation. Already-captured frames are kept.
    ///
    /// Stopping twice is harmless; stopping with nothing to stop is
    /// [`CommandError::NotRecording`].
    pub fn stop(&self) -> Result<(), CommandError> {
        let mut slot = self.slot.lock();
        match slot.state {
            RecorderState::Recording => {
                slot.state = RecorderState::Cancelling;
                if let Some(cancel) = &slot.cancel {
                    cancel.cancel();
                }
                Ok(())
            }
            RecorderState::Cancelling => Ok(()),
            RecorderState::Idle | RecorderState::Flushing => Err(CommandError::NotRecording),
        }
    }

    fn enter_flushing(&self) {
        let mut slot = self.slot.lock();
        if matches!(
            slot.state,
            RecorderState::Recording | RecorderState::Cancelling
        ) {
            slot.state = RecorderState::Flushing;
        }
    }

    fn reset(&self) {
        let mut slot = self.slot.lock();
        slot.state = RecorderState::Idle;
        slot.cancel = None;
    }
}

/// Exclusive claim on a [`Recorder`]. Dropping it returns the recorder to
/// `Idle`, whichever way the session ended.
#[derive(Debug)]
pub struct RecordingTicket {
    recorder: Arc<Recorder>,
    cancel: CancellationToken,
}

impl RecordingTicket {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RecordingTicket {
    fn drop(&mut self) {
        self.recorder.reset();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingOutcome {
    /// `video_end` was sent after `frames` frames.
    Delivered { frames: usize, cancelled: bool },
    /// Nothing was captured; one error status was sent.
    Empty,
    /// The device never went live; one error status was sent.
    DeviceFailed,
    /// The connection went away; the remaining envelopes were dropped.
    Aborted,
}

/// Runs one recording session to completion on `connection`.
pub async fn run_recording(
    connection: Arc<Connection>,
    ticket: RecordingTicket,
    mut device: Box<dyn CaptureDevice>,
    duration: RecordingDuration,
) -> RecordingOutcome {
    let connection_id = connection.id();
    let target = duration.target_frames();
    let cancel = ticket.cancel_token().clone();

    let frames_rx = match device.start().await {
        Ok(rx) => rx,
        Err(err) => {
            warn!(%connection_id, error = %err, "capture device failed to start");
            release(&mut *device).await;
            let _ = connection.send(&CommandError::from(err).to_status()).await;
            return RecordingOutcome::DeviceFailed;
        }
    };

    if connection.send(&ServerEvent::RecStarted).await.is_err() {
        release(&mut *device).await;
        return RecordingOutcome::Aborted;
    }
    info!(%connection_id, secs = duration.secs(), target, "recording started");
    counter!("tidewatch_recordings_started_total", 1);

    let buffer = Arc::new(Mutex::new(Vec::with_capacity(target)));
    let halt = CancellationToken::new();
    let mut capture = tokio::spawn(capture_loop(
        frames_rx,
        Arc::clone(&buffer),
        cancel.clone(),
        halt.clone(),
        target,
    ));

    let mut poll = tokio::time::interval(CAPTURE_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let finished_early = loop {
        tokio::select! {
            result = &mut capture => break Some(result),
            _ = poll.tick() => {
                if cancel.is_cancelled() || buffer.lock().len() >= target {
                    break None;
                }
            }
        }
    };

    ticket.recorder.enter_flushing();
    halt.cancel();
    let capture_result = match finished_early {
        Some(result) => result,
        None => capture.await,
    };
    let capture_error = match capture_result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(join) => Some(DeviceError::Stream(format!("capture task failed: {join}"))),
    };
    release(&mut *device).await;

    let frames = std::mem::take(&mut *buffer.lock());
    let cancelled = cancel.is_cancelled();
    debug!(
        %connection_id,
        frames = frames.len(),
        cancelled,
        error = ?capture_error,
        "capture finished; flushing"
    );

    if !connection.is_open() {
        return RecordingOutcome::Aborted;
    }

    if frames.is_empty() {
        let status = match capture_error {
            Some(err) => CommandError::from(err).to_status(),
            None => Status::error("No frames captured"),
        };
        let _ = connection.send(&status).await;
        return RecordingOutcome::Empty;
    }
    if let Some(err) = &capture_error {
        warn!(%connection_id, error = %err, "capture ended early; sending partial recording");
    }

    let count = frames.len();
    match send_batches(&connection, frames).await {
        Ok(()) => {
            info!(%connection_id, frames = count, cancelled, "recording delivered");
            RecordingOutcome::Delivered {
                frames: count,
                cancelled,
            }
        }
        Err(err) => {
            debug!(%connection_id, error = %err, "recording flush aborted");
            RecordingOutcome::Aborted
        }
    }
}

async fn capture_loop(
    mut frames: FrameReceiver,
    buffer: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
    halt: CancellationToken,
    target: usize,
) -> Result<(), DeviceError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = halt.cancelled() => return Ok(()),
            next = frames.recv() => next,
        };
        let frame = match next {
            Some(frame) => frame?,
            None => {
                return Err(DeviceError::Stream(
                    "device stopped delivering frames".into(),
                ))
            }
        };
        if cancel.is_cancelled() || buffer.lock().len() >= target {
            // Frames past the stop point or the target are dropped; keep
            // draining until the driver halts us.
            continue;
        }
        // Encoding is CPU-bound; keep it off the runtime threads.
        let encoded = tokio::task::spawn_blocking(move || encode_jpeg_base64(&frame, JPEG_QUALITY))
            .await
            .map_err(|err| DeviceError::Encode(format!("encoder task failed: {err}")))??;
        let mut frames_so_far = buffer.lock();
        if frames_so_far.len() < target {
            frames_so_far.push(encoded);
            counter!("tidewatch_frames_captured_total", 1);
        }
    }
}

async fn release(device: &mut dyn CaptureDevice) {
    if let Err(err) = device.stop().await {
        debug!(error = %err, "ignoring error while stopping capture device");
    }
}

async fn send_batches(connection: &Connection, frames: Vec<String>) -> Result<(), TransportError> {
    connection
        .send(&ServerEvent::VideoStart {
            count: frames.len() as u64,
        })
        .await?;

    let mut frames = frames.into_iter().enumerate().peekable();
    let mut first = true;
    while frames.peek().is_some() {
        if !first {
            tokio::time::sleep(INTER_BATCH_DELAY).await;
        }
        first = false;
        let batch: Vec<FrameData> = frames
            .by_ref()
            .take(FRAME_BATCH_SIZE)
            .map(|(index, data)| FrameData {
                index: index as u64,
                data,
            })
            .collect();
        connection
            .send(&ServerEvent::VideoBatch { frames: batch })
            .await?;
    }

    connection.send(&ServerEvent::VideoEnd).await
}
