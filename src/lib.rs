// THEORY:
// This file is the main entry point for the `lure_vision` library crate. It
// exposes two things to consumers: the one-shot `detect` search and the
// `DetectionPipeline` that drives the `AutomationStateMachine` frame by frame.
//
// The engine is layered, leaves first:
// 1.  `Frame`/`Pixel`: owned RGBA buffers and the two luma transforms.
// 2.  `FramePrecomputation` and `TemplateCache`: per-frame integral tables and
//     per-size template statistics.
// 3.  `match_template`: masked normalized cross-correlation at one scale.
// 4.  `ScaleSearch`: bounded parallel fan-out over scales with early stop.
// 5.  `MotionEventDetector`: frame differencing over the monitoring ROI.
// 6.  `AutomationStateMachine`: the serialized actor that sequences the cycle
//     and fires the host's `ActionCallbacks`.
//
// Capture, input synthesis and window focus are the host's business; they
// reach the engine only through `FrameSource` and `ActionCallbacks`.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use crate::config::Config;
pub use crate::core_modules::actions::{ActionCallbacks, ActionError, KeyCode, NoopActions};
pub use crate::core_modules::automation::{AutomationSettings, AutomationState, AutomationStateMachine};
pub use crate::core_modules::frame::{Frame, FramePool, Rect};
pub use crate::core_modules::motion_detector::{MotionEventDetector, MotionTuning};
pub use crate::error::{VisionError, VisionResult};
pub use crate::pipeline::{DetectionPipeline, FrameOutcome, FrameSource, MatchOptions, MatchResult, detect};
