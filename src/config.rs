// THEORY:
// One flat, serde-backed configuration drives every layer: the scale search,
// the matcher, the monitoring ROI, the motion detector and the automation
// timers. Missing fields take their defaults (`#[serde(default)]`), and
// `validate` replaces nonsensical values with defaults instead of failing, so a
// hand-edited file never stops the cycle from running.

use crate::core_modules::automation::AutomationSettings;
use crate::core_modules::motion_detector::MotionTuning;
use crate::core_modules::scale_search::{ScaleSet, SearchOptions};
use crate::core_modules::template_matcher::MatchOptions;
use crate::error::{VisionError, VisionResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub min_scale: f64,
    pub max_scale: f64,
    pub scale_step: f64,
    /// Explicit scale list; overrides the min/max/step range when non-empty.
    pub scales: Vec<f64>,
    pub threshold: f64,
    pub stride: usize,
    pub refine: bool,
    pub use_rgb: bool,
    /// Early-stop score for the scale search. Zero or below disables it.
    pub stop_on_score: f64,
    pub return_best_even: bool,
    /// Side length of the square monitoring ROI, in pixels.
    pub roi_size: usize,
    pub cooldown_seconds: f64,
    /// Monitoring timeout. Zero disables it.
    pub max_cast_duration_seconds: f64,
    pub search_timeout_seconds: f64,
    /// Key token pressed to cast, e.g. `F3` or `R`.
    pub cast_key: String,
    /// Frames are down-sampled by this factor in (0, 1] before searching.
    pub analysis_scale: f64,
    /// Record per-scale scan timings.
    pub debug: bool,
    pub motion: MotionTuning,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_scale: 0.60,
            max_scale: 1.40,
            scale_step: 0.05,
            scales: Vec::new(),
            threshold: 0.80,
            stride: 4,
            refine: true,
            use_rgb: true,
            stop_on_score: 0.95,
            return_best_even: true,
            roi_size: 40,
            cooldown_seconds: 2.0,
            max_cast_duration_seconds: 25.0,
            search_timeout_seconds: 5.0,
            cast_key: "F3".to_string(),
            analysis_scale: 1.0,
            debug: false,
            motion: MotionTuning::default(),
        }
    }
}

impl Config {
    /// Reads a JSON config file and normalizes it.
    pub fn load(path: impl AsRef<Path>) -> VisionResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VisionError::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> VisionResult<Self> {
        let mut config: Config = serde_json::from_str(text)?;
        config.validate();
        Ok(config)
    }

    /// Replaces out-of-range values with defaults. Returns the names of the
    /// fields that were changed.
    pub fn validate(&mut self) -> Vec<&'static str> {
        let defaults = Config::default();
        let mut fixed = Vec::new();

        if !self.min_scale.is_finite() || self.min_scale <= 0.0 {
            self.min_scale = defaults.min_scale;
            fixed.push("min_scale");
        }
        if !self.max_scale.is_finite() || self.max_scale < self.min_scale {
            self.max_scale = defaults.max_scale.max(self.min_scale);
            fixed.push("max_scale");
        }
        if !self.scale_step.is_finite() || self.scale_step <= 0.0 {
            self.scale_step = defaults.scale_step;
            fixed.push("scale_step");
        }
        let before = self.scales.len();
        self.scales.retain(|s| s.is_finite() && *s > 0.0);
        if self.scales.len() != before {
            fixed.push("scales");
        }
        if !self.threshold.is_finite() || self.threshold <= 0.0 || self.threshold > 1.0 {
            self.threshold = defaults.threshold;
            fixed.push("threshold");
        }
        if self.stride == 0 {
            self.stride = defaults.stride;
            fixed.push("stride");
        }
        if !self.stop_on_score.is_finite() {
            self.stop_on_score = defaults.stop_on_score;
            fixed.push("stop_on_score");
        }
        if self.stop_on_score > 0.0 && self.stop_on_score < self.threshold {
            self.stop_on_score = self.threshold;
            fixed.push("stop_on_score");
        }
        if self.roi_size == 0 {
            self.roi_size = defaults.roi_size;
            fixed.push("roi_size");
        }
        if !self.cooldown_seconds.is_finite() || self.cooldown_seconds < 0.0 {
            self.cooldown_seconds = defaults.cooldown_seconds;
            fixed.push("cooldown_seconds");
        }
        if !self.max_cast_duration_seconds.is_finite() || self.max_cast_duration_seconds < 0.0 {
            self.max_cast_duration_seconds = defaults.max_cast_duration_seconds;
            fixed.push("max_cast_duration_seconds");
        }
        if !self.search_timeout_seconds.is_finite() || self.search_timeout_seconds <= 0.0 {
            self.search_timeout_seconds = defaults.search_timeout_seconds;
            fixed.push("search_timeout_seconds");
        }
        if self.cast_key.trim().is_empty() {
            self.cast_key = defaults.cast_key;
            fixed.push("cast_key");
        }
        if !self.analysis_scale.is_finite() || self.analysis_scale <= 0.0 || self.analysis_scale > 1.0 {
            self.analysis_scale = defaults.analysis_scale;
            fixed.push("analysis_scale");
        }
        if self.motion.window == 0 || !(0.0..=1.0).contains(&self.motion.ema_alpha) {
            self.motion = MotionTuning::default();
            fixed.push("motion");
        }

        for field in &fixed {
            warn!(field, "invalid configuration value replaced");
        }
        fixed
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            threshold: self.threshold,
            stride: self.stride,
            refine: self.refine,
            return_best_even: self.return_best_even,
            use_rgb: self.use_rgb,
            debug_timing: self.debug,
        }
    }

    pub fn search_options(&self) -> SearchOptions {
        let scales = if self.scales.is_empty() {
            ScaleSet::Range { min: self.min_scale, max: self.max_scale, step: self.scale_step }
        } else {
            ScaleSet::Explicit(self.scales.clone())
        };
        SearchOptions {
            scales,
            matching: self.match_options(),
            stop_on_score: (self.stop_on_score > 0.0).then_some(self.stop_on_score),
        }
    }

    pub fn automation_settings(&self) -> AutomationSettings {
        AutomationSettings {
            search_timeout: Duration::from_secs_f64(self.search_timeout_seconds),
            cooldown: Duration::from_secs_f64(self.cooldown_seconds),
            cast_key: self.cast_key.clone(),
            max_cast_duration: (self.max_cast_duration_seconds > 0.0)
                .then(|| Duration::from_secs_f64(self.max_cast_duration_seconds)),
            motion: self.motion.clone(),
            ..AutomationSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_describe_a_usable_search() {
        let config = Config::default();
        let options = config.search_options();
        assert_eq!(options.scales.factors().len(), 17);
        assert_eq!(options.stop_on_score, Some(0.95));
        assert_eq!(options.matching.stride, 4);
        assert!(options.matching.use_rgb);
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let mut config = Config {
            min_scale: -1.0,
            scale_step: 0.0,
            threshold: 1.5,
            stride: 0,
            stop_on_score: 0.5,
            roi_size: 0,
            analysis_scale: 2.0,
            cast_key: "  ".into(),
            ..Config::default()
        };
        let fixed = config.validate();
        assert_eq!(config.min_scale, 0.60);
        assert_eq!(config.scale_step, 0.05);
        assert_eq!(config.threshold, 0.80);
        assert_eq!(config.stride, 4);
        assert_eq!(config.stop_on_score, 0.80);
        assert_eq!(config.roi_size, 40);
        assert_eq!(config.analysis_scale, 1.0);
        assert_eq!(config.cast_key, "F3");
        assert!(fixed.contains(&"stop_on_score"));
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config = Config::from_json(r#"{ "threshold": 0.9, "scales": [1.0, 0.5], "motion": { "debounce": 3 } }"#)
            .unwrap();
        assert_eq!(config.threshold, 0.9);
        assert_eq!(config.stop_on_score, 0.95);
        assert_eq!(config.search_options().scales, ScaleSet::Explicit(vec![1.0, 0.5]));
        assert_eq!(config.motion.debounce, 3);
        assert_eq!(config.motion.window, 20);
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "cooldown_seconds": 1.5, "max_cast_duration_seconds": 0 }}"#).unwrap();
        let config = Config::load(file.path()).unwrap();
        let settings = config.automation_settings();
        assert_eq!(settings.cooldown, Duration::from_millis(1500));
        assert_eq!(settings.max_cast_duration, None);

        assert!(matches!(Config::load("/definitely/not/here.json"), Err(VisionError::FileNotFound(_))));
        assert!(matches!(Config::from_json("{ nope"), Err(VisionError::JsonParse(_))));
    }
}
