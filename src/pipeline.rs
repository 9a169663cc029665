// THEORY:
// The `pipeline` module is the top-level API of the engine. It ties the
// detection core to the automation actor: every captured frame goes through
// `DetectionPipeline::process_frame`, which asks the state machine what it is
// doing and routes the frame accordingly.
//
// Key architectural principles:
// 1.  **State decides the work**: while `Searching`, the frame is (optionally)
//     down-sampled by the analysis scale and handed to the parallel scale
//     search; a match centre is mapped back to full-frame coordinates, shifted
//     by the capture origin, and reported as `target_acquired_at`. While
//     `Monitoring`, a square ROI around the locked coordinate is cropped and
//     fed to the actor's motion detector. Every other state ignores frames.
// 2.  **Per-template cache, per-frame statistics**: the template cache lives as
//     long as the pipeline; frame statistics are rebuilt for every frame.
// 3.  **Capture is a collaborator**: `FrameSource` is the only thing the run
//     loop knows about where frames come from.
//
// `detect` is the one-shot entry point for callers that only want a match.

use crate::config::Config;
use crate::core_modules::automation::{AutomationState, AutomationStateMachine};
use crate::core_modules::frame::{Frame, FramePool, Rect};
use crate::core_modules::frame_statistics::FramePrecomputation;
use crate::core_modules::scale_search::ScaleSearch;
use crate::core_modules::template_cache::TemplateCache;
use crate::error::VisionResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::template_matcher::{MatchOptions, MatchResult};

/// Supplies frames to the run loop. `Ok(None)` ends the stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> VisionResult<Option<Frame>>;
}

/// Finds `template` in `frame` across the configured scales.
pub async fn detect(frame: &Frame, template: &Frame, config: &Config) -> MatchResult {
    let Some(cache) = TemplateCache::new(template) else {
        debug!("template is empty or fully transparent");
        return MatchResult::not_found();
    };
    if frame.is_empty() {
        return MatchResult::not_found();
    }
    let statistics = Arc::new(FramePrecomputation::build(frame, config.use_rgb));
    ScaleSearch::new()
        .search(statistics, Arc::new(cache), &config.search_options())
        .await
}

/// What the pipeline did with one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// The machine was in a state that does not consume frames.
    Ignored(AutomationState),
    /// A search ran; the result is in full-frame coordinates.
    Searched(MatchResult),
    /// The ROI at this rectangle was sent to the motion detector.
    Monitored(Rect),
}

pub struct DetectionPipeline {
    config: Config,
    search: ScaleSearch,
    cache: Option<Arc<TemplateCache>>,
    pool: FramePool,
    origin: (i32, i32),
}

impl DetectionPipeline {
    pub fn new(template: &Frame, config: Config) -> Self {
        let cache = TemplateCache::new(template).map(Arc::new);
        if cache.is_none() {
            warn!("template has no opaque pixels, searches will never match");
        }
        DetectionPipeline {
            config,
            search: ScaleSearch::new(),
            cache,
            pool: FramePool::default(),
            origin: (0, 0),
        }
    }

    /// Screen position of the frame's top-left pixel. Reported targets are
    /// shifted by it; locked targets are shifted back before cropping.
    pub fn with_origin(mut self, x: i32, y: i32) -> Self {
        self.origin = (x, y);
        self
    }

    pub fn with_search(mut self, search: ScaleSearch) -> Self {
        self.search = search;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Searches one frame, honouring the analysis scale. Coordinates in the
    /// result are relative to `frame`.
    pub async fn search_frame(&self, frame: &Frame) -> MatchResult {
        let Some(cache) = &self.cache else {
            return MatchResult::not_found();
        };
        if frame.is_empty() {
            return MatchResult::not_found();
        }
        let scale = self.config.analysis_scale;
        let downscaled = scale < 1.0;
        let statistics = if downscaled {
            let analysed = frame.downscale_into(scale, self.pool.acquire());
            let statistics = FramePrecomputation::build(&analysed, self.config.use_rgb);
            self.pool.release(analysed.into_bytes());
            statistics
        } else {
            FramePrecomputation::build(frame, self.config.use_rgb)
        };
        let statistics = Arc::new(statistics);

        let mut result = self
            .search
            .search(statistics, Arc::clone(cache), &self.config.search_options())
            .await;
        if downscaled {
            let up = |v: usize| (v as f64 / scale).round() as usize;
            result.position = result.position.map(|(x, y)| (up(x), up(y)));
            result.width = up(result.width);
            result.height = up(result.height);
        }
        result
    }

    /// Routes one frame according to the machine's current state.
    pub async fn process_frame(&self, fsm: &AutomationStateMachine, frame: &Frame) -> FrameOutcome {
        match fsm.current_state() {
            AutomationState::Searching => {
                let result = self.search_frame(frame).await;
                if result.found {
                    if let Some((cx, cy)) = result.center() {
                        let (x, y) = (cx + self.origin.0, cy + self.origin.1);
                        info!(x, y, score = result.score, scale = result.scale, "target acquired");
                        fsm.target_acquired_at(x, y).await;
                    }
                }
                FrameOutcome::Searched(result)
            }
            AutomationState::Monitoring => {
                let Some((x, y)) = fsm.locked_coordinates() else {
                    return FrameOutcome::Ignored(AutomationState::Monitoring);
                };
                let (roi, rect) =
                    frame.extract_roi(x - self.origin.0, y - self.origin.1, self.config.roi_size);
                fsm.process_monitoring_frame(roi, Instant::now()).await;
                FrameOutcome::Monitored(rect)
            }
            state => FrameOutcome::Ignored(state),
        }
    }

    /// Pulls frames from `source` until it is exhausted.
    pub async fn run<S: FrameSource>(&self, source: &mut S, fsm: &AutomationStateMachine) -> VisionResult<u64> {
        let mut frames = 0u64;
        while let Some(frame) = source.next_frame().await? {
            self.process_frame(fsm, &frame).await;
            frames += 1;
        }
        debug!(frames, "frame source exhausted");
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::actions::NoopActions;
    use crate::core_modules::pixel::pixel::Pixel;
    use crate::core_modules::scale_search::ScaleSet;

    fn scene(width: usize, height: usize) -> Frame {
        let mut frame = Frame::filled(width, height, Pixel::new(0, 0, 0, 255));
        for y in 0..height {
            for x in 0..width {
                let r = (x * 7 + y * 13) % 97;
                let g = (x * x + y * 3) % 89;
                let b = (x * y + 11) % 83;
                frame.put_pixel(x, y, Pixel::new(r as u8 * 2, g as u8 * 2, b as u8 * 3, 255));
            }
        }
        frame
    }

    fn exact_config() -> Config {
        Config {
            scales: vec![1.0],
            stride: 1,
            stop_on_score: 0.0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn detect_locates_a_cropped_template() {
        let frame = scene(80, 60);
        let template = frame.crop(Rect::new(33, 17, 18, 14));
        let result = detect(&frame, &template, &exact_config()).await;
        assert!(result.found);
        assert_eq!(result.position, Some((33, 17)));
        assert_eq!(result.center(), Some((42, 24)));
    }

    #[tokio::test]
    async fn detect_with_empty_inputs_is_not_found() {
        let frame = scene(20, 20);
        assert!(!detect(&Frame::empty(), &frame.crop(Rect::new(0, 0, 4, 4)), &Config::default()).await.found);
        assert!(!detect(&frame, &Frame::empty(), &Config::default()).await.found);
        let clear = Frame::filled(4, 4, Pixel::new(1, 2, 3, 0));
        assert!(!detect(&frame, &clear, &Config::default()).await.found);
    }

    #[tokio::test]
    async fn down_scaled_matches_map_back_to_full_resolution() {
        let frame = scene(160, 120);
        let half = frame.downscale(0.5);
        let template = half.crop(Rect::new(30, 22, 20, 16));
        let config = Config { analysis_scale: 0.5, ..exact_config() };
        let pipeline = DetectionPipeline::new(&template, config);
        let result = pipeline.search_frame(&frame).await;
        assert!(result.found);
        assert_eq!(result.position, Some((60, 44)));
        assert_eq!((result.width, result.height), (40, 32));
        assert_eq!(result.center(), Some((80, 60)));
    }

    #[tokio::test]
    async fn frames_drive_the_machine_from_search_to_monitoring() {
        let frame = scene(80, 60);
        let template = frame.crop(Rect::new(20, 10, 16, 12));
        let pipeline = DetectionPipeline::new(&template, exact_config())
            .with_origin(100, 200)
            .with_search(ScaleSearch::with_workers(2));
        let fsm = AutomationStateMachine::spawn(Default::default(), Arc::new(NoopActions));

        assert_eq!(pipeline.process_frame(&fsm, &frame).await, FrameOutcome::Ignored(AutomationState::Halt));

        fsm.await_focus().await;
        fsm.focus_acquired().await;
        fsm.flush().await;
        let outcome = pipeline.process_frame(&fsm, &frame).await;
        assert!(matches!(outcome, FrameOutcome::Searched(ref r) if r.found));
        fsm.flush().await;
        assert_eq!(fsm.current_state(), AutomationState::Monitoring);
        assert_eq!(fsm.locked_coordinates(), Some((128, 216)));

        let outcome = pipeline.process_frame(&fsm, &frame).await;
        assert_eq!(outcome, FrameOutcome::Monitored(Rect::new(8, 0, 40, 40)));
        assert_eq!(pipeline.config().search_options().scales, ScaleSet::Explicit(vec![1.0]));
    }

    struct Replay(Vec<Frame>);

    #[async_trait]
    impl FrameSource for Replay {
        async fn next_frame(&mut self) -> VisionResult<Option<Frame>> {
            Ok(self.0.pop())
        }
    }

    #[tokio::test]
    async fn run_consumes_every_frame() {
        let frame = scene(40, 30);
        let pipeline = DetectionPipeline::new(&frame.crop(Rect::new(5, 5, 8, 8)), exact_config());
        let fsm = AutomationStateMachine::spawn(Default::default(), Arc::new(NoopActions));
        let mut source = Replay(vec![frame.clone(), frame.clone(), frame]);
        assert_eq!(pipeline.run(&mut source, &fsm).await.unwrap(), 3);
    }
}
