use std::time::Duration;

use tidewatch_proto::{FrameData, CAPTURE_FPS};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Nothing received yet.
    Empty,
    /// `video_start` seen; batches arriving.
    Loading { expected: u64 },
    /// `video_end` seen with no frames.
    NoData,
    Playing,
    Paused,
    /// Stopped on the last frame; [`FramePlayer::play`] replays from 0.
    Ended,
}

/// Accumulates `video_batch` frames and plays them back at the fixed stream
/// rate.
#[derive(Debug, Clone)]
pub struct FramePlayer {
    frames: Vec<String>,
    position: usize,
    state: PlayerState,
    fps: u32,
}

impl Default for FramePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePlayer {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            position: 0,
            state: PlayerState::Empty,
            fps: CAPTURE_FPS,
        }
    }

    pub fn on_video_start(&mut self, count: u64) {
        self.frames.clear();
        self.frames
            .reserve(usize::try_from(count).unwrap_or(0).min(64 * 1024));
        self.position = 0;
        self.state = PlayerState::Loading { expected: count };
    }

    /// Places each frame at its announced index. Batches arrive in
    /// non-decreasing order, so in practice this appends.
    pub fn on_video_batch(&mut self, frames: Vec<FrameData>) {
        for frame in frames {
            let index = usize::try_from(frame.index).unwrap_or(usize::MAX);
            match self.frames.get_mut(index) {
                Some(slot) => *slot = frame.data,
                None => self.frames.push(frame.data),
            }
        }
    }

    /// Returns `true` when playback started, `false` when there is nothing to
    /// play.
    pub fn on_video_end(&mut self) -> bool {
        self.position = 0;
        if self.frames.is_empty() {
            self.state = PlayerState::NoData;
            false
        } else {
            self.state = PlayerState::Playing;
            true
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn current_frame(&self) -> Option<&str> {
        self.frames.get(self.position).map(String::as_str)
    }

    pub fn play(&mut self) {
        match self.state {
            PlayerState::Ended => {
                self.position = 0;
                self.state = PlayerState::Playing;
            }
            PlayerState::Paused => self.state = PlayerState::Playing,
            _ => {}
        }
    }

    pub fn pause(&mut self) {
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
        }
    }

    /// Jumps to `index` (clamped to the last frame) and pauses auto-advance.
    pub fn seek(&mut self, index: usize) {
        if self.frames.is_empty() {
            return;
        }
        self.position = index.min(self.frames.len() - 1);
        self.state = PlayerState::Paused;
    }

    /// Advances one frame while playing. Reaching the last frame ends
    /// playback there.
    pub fn tick(&mut self) -> Option<&str> {
        if self.state != PlayerState::Playing {
            return None;
        }
        if self.position + 1 < self.frames.len() {
            self.position += 1;
        } else {
            self.state = PlayerState::Ended;
        }
        self.current_frame()
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames.len(), self.fps)
    }

    /// Time of the displayed frame. Once playback has ended the clock shows the
    /// full duration.
    pub fn elapsed(&self) -> Duration {
        if self.state == PlayerState::Ended {
            self.duration()
        } else {
            frames_to_duration(self.position, self.fps)
        }
    }

    pub fn elapsed_label(&self) -> String {
        format_clock(self.elapsed())
    }

    pub fn duration_label(&self) -> String {
        format_clock(self.duration())
    }

    /// Plays from the current position at the stream rate until playback
    /// ends or is paused, calling `on_frame` for every displayed frame.
    pub async fn run<F>(&mut self, mut on_frame: F)
    where
        F: FnMut(usize, &str),
    {
        if self.state != PlayerState::Playing {
            return;
        }
        let mut ticker = interval(frames_to_duration(1, self.fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        if let Some(frame) = self.current_frame() {
            on_frame(self.position, frame);
        }
        while self.state == PlayerState::Playing {
            ticker.tick().await;
            let before = self.position;
            if self.tick().is_none() {
                break;
            }
            let position = self.position;
            if position != before {
                if let Some(frame) = self.frames.get(position) {
                    on_frame(position, frame);
                }
            }
        }
    }
}

fn frames_to_duration(frames: usize, fps: u32) -> Duration {
    if fps == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / f64::from(fps))
}

/// `mm:ss`, truncating partial seconds.
pub fn format_clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(range: std::ops::Range<u64>) -> Vec<FrameData> {
        range
            .map(|index| FrameData {
                index,
                data: format!("frame-{index}"),
            })
            .collect()
    }

    fn loaded(count: u64) -> FramePlayer {
        let mut player = FramePlayer::new();
        player.on_video_start(count);
        let mut next = 0;
        while next < count {
            let end = (next + 30).min(count);
            player.on_video_batch(batch(next..end));
            next = end;
        }
        player
    }

    #[test_timeout::timeout]
    fn five_second_recording_clock_runs_from_zero_to_five() {
        let mut player = loaded(150);
        assert!(player.on_video_end());
        assert_eq!(player.state(), PlayerState::Playing);
        assert_eq!(player.elapsed_label(), "00:00");
        assert_eq!(player.duration_label(), "00:05");

        while player.state() == PlayerState::Playing {
            player.tick();
        }
        assert_eq!(player.state(), PlayerState::Ended);
        assert_eq!(player.position(), 149);
        assert_eq!(player.elapsed_label(), "00:05");
    }

    #[test_timeout::timeout]
    fn seek_pauses_and_play_resumes() {
        let mut player = loaded(90);
        player.on_video_end();
        player.seek(45);
        assert_eq!(player.state(), PlayerState::Paused);
        assert_eq!(player.elapsed_label(), "00:01");
        assert_eq!(player.tick(), None);

        player.play();
        assert_eq!(player.tick(), Some("frame-46"));
        player.seek(10_000);
        assert_eq!(player.position(), 89);
    }

    #[test_timeout::timeout]
    fn replay_restarts_from_the_first_frame() {
        let mut player = loaded(2);
        player.on_video_end();
        player.tick();
        player.tick();
        assert_eq!(player.state(), PlayerState::Ended);
        player.play();
        assert_eq!(player.position(), 0);
        assert_eq!(player.current_frame(), Some("frame-0"));
    }

    #[test_timeout::timeout]
    fn empty_recording_reports_no_data() {
        let mut player = FramePlayer::new();
        player.on_video_start(0);
        assert!(!player.on_video_end());
        assert_eq!(player.state(), PlayerState::NoData);
        assert_eq!(player.duration_label(), "00:00");
    }

    #[test_timeout::timeout]
    fn new_recording_replaces_the_old_one() {
        let mut player = loaded(60);
        player.on_video_end();
        player.on_video_start(30);
        assert_eq!(player.frame_count(), 0);
        assert_eq!(player.state(), PlayerState::Loading { expected: 30 });
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn run_shows_every_frame_at_the_stream_rate() {
        let mut player = loaded(60);
        player.on_video_end();
        let started = tokio::time::Instant::now();
        let mut shown = Vec::new();
        player.run(|index, _| shown.push(index)).await;

        assert_eq!(shown, (0..60).collect::<Vec<_>>());
        assert_eq!(player.state(), PlayerState::Ended);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2100), "{elapsed:?}");
    }

    #[test_timeout::timeout]
    fn clock_formats_minutes() {
        assert_eq!(format_clock(Duration::from_secs(300)), "05:00");
        assert_eq!(format_clock(Duration::from_millis(61_999)), "01:01");
    }
}
