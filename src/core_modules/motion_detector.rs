// THEORY:
// Once the target is locked, the interesting event is a short, sharp burst of
// motion inside a small ROI around it. The `MotionEventDetector` watches that
// ROI frame by frame and fires exactly once per monitoring session.
//
// Three signals are computed per frame from an integer luma image:
//   * `dt`             mean absolute difference against the previous frame
//   * `ratio_changed`  fraction of pixels whose difference exceeds a fixed step
//   * `diff_base_mean` mean absolute difference against a slow EMA baseline
//
// Key architectural principles:
// 1.  **Three independent detectors**: a statistical `spike` (dt far above its
//     own recent history), a `base_jump` (a sustained departure from the slow
//     baseline), and a `big_immediate` escape hatch for large motion that
//     arrives before enough history has accumulated. Each must also see a
//     minimum fraction of changed pixels, which rejects sensor noise spread
//     thinly over the ROI.
// 2.  **Debounce**: consecutive candidate frames form a run. The detector fires
//     once the run reaches the debounce length, or immediately on a single
//     `big_immediate` frame.
// 3.  **Self-protecting baseline**: while a run is in progress the rolling
//     window is frozen so the burst cannot inflate the statistics it is being
//     measured against. The EMA keeps adapting on every non-firing frame.
// 4.  **One shot per session**: after firing, the detector ignores input until
//     `reset()`, which also restarts the session clock used for the timeout.
// 5.  **Tunable, not hard-coded**: every threshold lives in `MotionTuning`,
//     with a sensitive default and a conservative preset.

use crate::core_modules::frame::Frame;
use crate::core_modules::rolling_window::RollingWindow;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Thresholds and rates for the motion detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionTuning {
    /// Capacity of the rolling window of per-frame differences.
    pub window: usize,
    /// History needed before the statistical spike test applies.
    pub min_samples: usize,
    /// Per-pixel luma step that counts a pixel as changed.
    pub pixel_diff_threshold: u8,
    pub spike_ratio: f64,
    pub base_ratio: f64,
    pub baseline_diff_threshold: f64,
    pub std_dev_multiplier: f64,
    pub big_immediate_ratio: f64,
    pub big_immediate_diff: f64,
    pub ema_alpha: f32,
    /// Consecutive candidate frames required to fire.
    pub debounce: u32,
}

impl Default for MotionTuning {
    fn default() -> Self {
        MotionTuning::sensitive()
    }
}

impl MotionTuning {
    /// Fires on small, quick disturbances.
    pub fn sensitive() -> Self {
        MotionTuning {
            window: 20,
            min_samples: 5,
            pixel_diff_threshold: 10,
            spike_ratio: 0.18,
            base_ratio: 0.12,
            baseline_diff_threshold: 14.0,
            std_dev_multiplier: 2.0,
            big_immediate_ratio: 0.20,
            big_immediate_diff: 12.0,
            ema_alpha: 0.03,
            debounce: 1,
        }
    }

    /// Needs larger, longer disturbances; suits noisy scenes.
    pub fn conservative() -> Self {
        MotionTuning {
            window: 30,
            min_samples: 8,
            pixel_diff_threshold: 14,
            spike_ratio: 0.25,
            base_ratio: 0.18,
            baseline_diff_threshold: 18.0,
            std_dev_multiplier: 3.0,
            big_immediate_ratio: 0.30,
            big_immediate_diff: 18.0,
            ema_alpha: 0.02,
            debounce: 2,
        }
    }
}

/// The signals computed for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionSignals {
    pub dt: f64,
    pub ratio_changed: f64,
    pub diff_base_mean: f64,
    pub spike: bool,
    pub base_jump: bool,
    pub big_immediate: bool,
}

impl MotionSignals {
    pub fn is_candidate(&self) -> bool {
        self.spike || self.base_jump || self.big_immediate
    }
}

/// Counters describing the current session, for tuning and logging.
#[derive(Debug, Clone, Default)]
pub struct MotionDiagnostics {
    pub frames_seen: u64,
    pub runs_started: u32,
    pub runs_aborted: u32,
    pub longest_run: u32,
    pub min_dt: Option<f64>,
    pub max_dt: Option<f64>,
    pub last: Option<MotionSignals>,
    pub last_frame_at: Option<Instant>,
}

#[derive(Debug)]
pub struct MotionEventDetector {
    tuning: MotionTuning,
    max_session: Option<Duration>,
    width: usize,
    height: usize,
    previous: Vec<u8>,
    current: Vec<u8>,
    ema: Vec<f32>,
    initialized: bool,
    window: RollingWindow,
    candidate_run: u32,
    triggered: bool,
    session_start: Instant,
    diagnostics: MotionDiagnostics,
}

impl MotionEventDetector {
    /// `max_session` of `None` (or zero) disables the timeout.
    pub fn new(tuning: MotionTuning, max_session: Option<Duration>) -> Self {
        let window = RollingWindow::new(tuning.window);
        MotionEventDetector {
            tuning,
            max_session: max_session.filter(|d| !d.is_zero()),
            width: 0,
            height: 0,
            previous: Vec::new(),
            current: Vec::new(),
            ema: Vec::new(),
            initialized: false,
            window,
            candidate_run: 0,
            triggered: false,
            session_start: Instant::now(),
            diagnostics: MotionDiagnostics::default(),
        }
    }

    pub fn tuning(&self) -> &MotionTuning {
        &self.tuning
    }

    pub fn diagnostics(&self) -> &MotionDiagnostics {
        &self.diagnostics
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Starts a new monitoring session.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.previous.clear();
        self.ema.clear();
        self.window.clear();
        self.candidate_run = 0;
        self.triggered = false;
        self.session_start = Instant::now();
        self.diagnostics = MotionDiagnostics::default();
    }

    pub fn is_timed_out(&self) -> bool {
        self.max_session
            .is_some_and(|max| self.session_start.elapsed() >= max)
    }

    /// Processes one ROI frame. Returns `true` on the frame that fires.
    pub fn feed(&mut self, roi: &Frame, timestamp: Instant) -> bool {
        if self.triggered || roi.is_empty() {
            return false;
        }
        self.diagnostics.frames_seen += 1;
        self.diagnostics.last_frame_at = Some(timestamp);

        self.current.clear();
        for y in 0..roi.height() {
            self.current
                .extend(roi.row(y).chunks_exact(4).map(fast_luma));
        }

        if !self.initialized || roi.width() != self.width || roi.height() != self.height {
            self.begin_baseline(roi.width(), roi.height());
            return false;
        }

        let signals = self.measure();
        self.record(&signals);

        if signals.is_candidate() {
            self.candidate_run += 1;
            if self.candidate_run == 1 {
                self.diagnostics.runs_started += 1;
            }
            self.diagnostics.longest_run = self.diagnostics.longest_run.max(self.candidate_run);
        } else {
            if self.candidate_run > 0 {
                self.diagnostics.runs_aborted += 1;
            }
            self.candidate_run = 0;
            self.window.push(signals.dt);
        }

        std::mem::swap(&mut self.previous, &mut self.current);

        let fires = signals.is_candidate()
            && (self.candidate_run >= self.tuning.debounce.max(1)
                || (signals.big_immediate && self.candidate_run == 1));
        if fires {
            self.triggered = true;
            debug!(
                dt = signals.dt,
                ratio_changed = signals.ratio_changed,
                diff_base_mean = signals.diff_base_mean,
                spike = signals.spike,
                base_jump = signals.base_jump,
                big_immediate = signals.big_immediate,
                run = self.candidate_run,
                "motion event fired"
            );
            return true;
        }

        let alpha = self.tuning.ema_alpha;
        for (ema, &cur) in self.ema.iter_mut().zip(&self.previous) {
            *ema = (*ema + alpha * (cur as f32 - *ema)).clamp(0.0, 255.0);
        }
        false
    }

    fn begin_baseline(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.previous.clear();
        self.previous.extend_from_slice(&self.current);
        self.ema.clear();
        self.ema.extend(self.current.iter().map(|&v| v as f32));
        self.window.clear();
        self.candidate_run = 0;
        self.initialized = true;
        trace!(width, height, "motion baseline initialised");
    }

    fn measure(&self) -> MotionSignals {
        let n = self.current.len() as f64;
        let threshold = self.tuning.pixel_diff_threshold;
        let mut sum_dt = 0u64;
        let mut changed = 0u64;
        let mut sum_base = 0.0f64;
        for ((&cur, &prev), &ema) in self.current.iter().zip(&self.previous).zip(&self.ema) {
            let d = cur.abs_diff(prev);
            sum_dt += d as u64;
            if d > threshold {
                changed += 1;
            }
            sum_base += (cur as f32 - ema).abs() as f64;
        }
        let dt = sum_dt as f64 / n;
        let ratio_changed = changed as f64 / n;
        let diff_base_mean = sum_base / n;

        let t = &self.tuning;
        let history = self.window.len();
        let spike = history >= t.min_samples
            && dt > self.window.mean() + t.std_dev_multiplier * self.window.std_dev()
            && ratio_changed > t.spike_ratio;
        let base_jump = diff_base_mean > t.baseline_diff_threshold && ratio_changed > t.base_ratio;
        let big_immediate = history < t.min_samples
            && ratio_changed > t.big_immediate_ratio
            && dt > t.big_immediate_diff;

        MotionSignals { dt, ratio_changed, diff_base_mean, spike, base_jump, big_immediate }
    }

    fn record(&mut self, signals: &MotionSignals) {
        let d = &mut self.diagnostics;
        d.min_dt = Some(d.min_dt.map_or(signals.dt, |m| m.min(signals.dt)));
        d.max_dt = Some(d.max_dt.map_or(signals.dt, |m| m.max(signals.dt)));
        d.last = Some(*signals);
        trace!(
            dt = signals.dt,
            ratio_changed = signals.ratio_changed,
            diff_base_mean = signals.diff_base_mean,
            "motion signals"
        );
    }
}

#[inline]
fn fast_luma(px: &[u8]) -> u8 {
    crate::core_modules::pixel::pixel::Pixel::from_rgba(px).fast_luma()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::pixel::pixel::Pixel;

    fn gray(size: usize, value: u8) -> Frame {
        Frame::filled(size, size, Pixel::new(value, value, value, 255))
    }

    fn with_square(mut frame: Frame, at: usize, side: usize, value: u8) -> Frame {
        for y in at..at + side {
            for x in at..at + side {
                frame.put_pixel(x, y, Pixel::new(value, value, value, 255));
            }
        }
        frame
    }

    #[test]
    fn jitter_below_the_pixel_threshold_never_fires() {
        let mut detector = MotionEventDetector::new(MotionTuning::default(), None);
        let now = Instant::now();
        for i in 0..50 {
            let mut frame = gray(40, 100);
            for y in 0..40 {
                for x in 0..40 {
                    let v = 100 + ((x + y + i) % 5) as u8;
                    frame.put_pixel(x, y, Pixel::new(v, v, v, 255));
                }
            }
            assert!(!detector.feed(&frame, now), "fired on frame {i}");
        }
        assert_eq!(detector.diagnostics().runs_started, 0);
    }

    #[test]
    fn raised_square_fires_on_the_first_elevated_frame_only() {
        let mut detector = MotionEventDetector::new(MotionTuning::default(), None);
        let now = Instant::now();
        let mut fired = Vec::new();
        for i in 0..7 {
            let frame = if i < 5 { gray(40, 80) } else { with_square(gray(40, 80), 10, 20, 140) };
            fired.push(detector.feed(&frame, now));
        }
        assert_eq!(fired, vec![false, false, false, false, false, true, false]);
        let last = detector.diagnostics().last.unwrap();
        assert!(last.base_jump && last.big_immediate);
        assert!((last.dt - 15.0).abs() < 1e-9);
        assert!((last.ratio_changed - 0.25).abs() < 1e-9);
    }

    #[test]
    fn statistical_spike_fires_after_history_builds() {
        let tuning = MotionTuning { baseline_diff_threshold: 1000.0, ..MotionTuning::default() };
        let mut detector = MotionEventDetector::new(tuning, None);
        let now = Instant::now();
        for i in 0..10 {
            let v = if i % 2 == 0 { 80 } else { 82 };
            assert!(!detector.feed(&gray(40, v), now));
        }
        let spike = with_square(gray(40, 82), 5, 30, 180);
        assert!(detector.feed(&spike, now));
        assert!(detector.diagnostics().last.unwrap().spike);
    }

    #[test]
    fn debounce_requires_consecutive_candidates() {
        let tuning = MotionTuning { debounce: 2, ..MotionTuning::default() };
        let mut detector = MotionEventDetector::new(tuning, None);
        let now = Instant::now();
        for _ in 0..8 {
            assert!(!detector.feed(&gray(40, 80), now));
        }
        // History is full, so only base_jump applies: needs two frames.
        assert!(!detector.feed(&with_square(gray(40, 80), 10, 20, 140), now));
        assert!(detector.feed(&with_square(gray(40, 80), 10, 20, 200), now));
        assert_eq!(detector.diagnostics().longest_run, 2);
    }

    #[test]
    fn slow_drift_is_absorbed() {
        let mut detector = MotionEventDetector::new(MotionTuning::default(), None);
        let now = Instant::now();
        for v in 40..200u8 {
            assert!(!detector.feed(&gray(32, v), now));
        }
    }

    #[test]
    fn reset_rearms_a_fired_detector() {
        let mut detector = MotionEventDetector::new(MotionTuning::default(), None);
        let now = Instant::now();
        detector.feed(&gray(40, 80), now);
        assert!(detector.feed(&with_square(gray(40, 80), 0, 40, 200), now));
        assert!(!detector.feed(&gray(40, 10), now));
        detector.reset();
        assert!(!detector.is_triggered());
        assert!(!detector.feed(&gray(40, 80), now));
        assert!(detector.feed(&with_square(gray(40, 80), 0, 40, 200), now));
    }

    #[test]
    fn resized_roi_restarts_the_baseline() {
        let mut detector = MotionEventDetector::new(MotionTuning::default(), None);
        let now = Instant::now();
        detector.feed(&gray(40, 80), now);
        assert!(!detector.feed(&gray(20, 250), now));
        assert!(!detector.feed(&gray(20, 250), now));
    }

    #[tokio::test(start_paused = true)]
    async fn session_times_out_after_the_configured_duration() {
        let mut detector = MotionEventDetector::new(MotionTuning::default(), Some(Duration::from_secs(25)));
        detector.reset();
        assert!(!detector.is_timed_out());
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(detector.is_timed_out());
        detector.reset();
        assert!(!detector.is_timed_out());

        let endless = MotionEventDetector::new(MotionTuning::default(), Some(Duration::ZERO));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!endless.is_timed_out());
    }
}
