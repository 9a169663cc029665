// THEORY:
// On-screen targets are drawn at sizes that drift with resolution and zoom, so a
// single-size scan is not enough. The `ScaleSearch` runs one independent
// template scan per scale factor and keeps the best.
//
// Key architectural principles:
// 1.  **Bounded fan-out**: each scale is a CPU-bound unit of work handed to
//     `spawn_blocking`. A semaphore sized to the available cores gates the
//     dispatch loop, so a 200-scale search never oversubscribes the machine.
// 2.  **Shared, read-only inputs**: every worker borrows the same
//     `FramePrecomputation` and `TemplateCache` through `Arc`s. The cache's
//     first-insert-wins rule is the only write that ever happens.
// 3.  **Single-claim early stop**: a worker whose score reaches the stop score
//     tries to flip an `AtomicBool` with compare-and-swap. Only the winner tags
//     its result as the stopping result. Once the flag is set, no further
//     scales are dispatched and queued workers return without scanning.
// 4.  **Fan-in over a channel**: results arrive on an unbounded channel in
//     completion order. A strictly greater score replaces the best, so ties
//     keep whichever result arrived first. That makes the reported scale on
//     ties depend on scheduling, which is accepted.
// 5.  **Skip before building**: a factor whose template would fall below the
//     minimum side or exceed the frame is skipped in the dispatch loop, before
//     the cache resamples anything. Skipped scales are not counted as
//     evaluated.
// 6.  **Panics are bugs**: when the search runs to completion, every worker
//     handle is joined and a panicking worker is re-raised in the caller.

use crate::core_modules::frame_statistics::FramePrecomputation;
use crate::core_modules::template_cache::TemplateCache;
use crate::core_modules::template_matcher::{MatchOptions, MatchResult, match_template};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::debug;

/// Upper bound on the number of scales in one search.
pub const MAX_SCALE_COUNT: usize = 200;

/// `min, min + step, ..., max` inclusive, at most `MAX_SCALE_COUNT` entries.
/// Degenerate ranges collapse to `[min]` (or `[1.0]` when `min` is unusable).
pub fn generate_scales(min: f64, max: f64, step: f64) -> Vec<f64> {
    if !min.is_finite() || min <= 0.0 {
        return vec![1.0];
    }
    if !max.is_finite() || !step.is_finite() || step <= 0.0 || max <= min {
        return vec![min];
    }
    let steps = (1 + ((max - min) / step + 0.5) as usize).min(MAX_SCALE_COUNT);
    (0..steps)
        .map(|i| min + i as f64 * step)
        .take_while(|&s| s <= max + 1e-9)
        .collect()
}

/// Which scale factors a search evaluates.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleSet {
    Explicit(Vec<f64>),
    Range { min: f64, max: f64, step: f64 },
}

impl ScaleSet {
    pub fn factors(&self) -> Vec<f64> {
        match self {
            ScaleSet::Explicit(list) => list
                .iter()
                .copied()
                .filter(|f| f.is_finite() && *f > 0.0)
                .take(MAX_SCALE_COUNT)
                .collect(),
            ScaleSet::Range { min, max, step } => generate_scales(*min, *max, *step),
        }
    }
}

impl Default for ScaleSet {
    fn default() -> Self {
        ScaleSet::Range { min: 0.60, max: 1.40, step: 0.05 }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    pub scales: ScaleSet,
    pub matching: MatchOptions,
    /// Stop dispatching once a scale scores at least this much. Raised to
    /// `matching.threshold` when set lower.
    pub stop_on_score: Option<f64>,
}

impl SearchOptions {
    fn effective_stop_score(&self) -> Option<f64> {
        self.stop_on_score.map(|s| s.max(self.matching.threshold))
    }
}

struct Published {
    result: MatchResult,
    claimed_stop: bool,
}

/// Parallel multi-scale template search.
#[derive(Debug, Clone)]
pub struct ScaleSearch {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl Default for ScaleSearch {
    fn default() -> Self {
        ScaleSearch::new()
    }
}

impl ScaleSearch {
    /// A search pool sized to the number of logical CPUs.
    pub fn new() -> Self {
        ScaleSearch::with_workers(num_cpus::get())
    }

    pub fn with_workers(workers: usize) -> Self {
        let workers = workers.max(1);
        ScaleSearch { permits: Arc::new(Semaphore::new(workers)), workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Best match of `cache`'s template over `frame` across all configured scales.
    pub async fn search(
        &self,
        frame: Arc<FramePrecomputation>,
        cache: Arc<TemplateCache>,
        options: &SearchOptions,
    ) -> MatchResult {
        let factors = options.scales.factors();
        let stop_score = options.effective_stop_score();
        let stop = Arc::new(AtomicBool::new(false));
        let evaluated = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<Published>();
        let mut handles = Vec::with_capacity(factors.len());

        for factor in factors {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let Some((width, height)) = cache.scaled_size(factor) else {
                debug!(factor, "scale skipped, template too small");
                continue;
            };
            if width > frame.width() || height > frame.height() {
                debug!(factor, width, height, "scale skipped, template larger than frame");
                continue;
            }
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            if stop.load(Ordering::Acquire) {
                break;
            }
            let frame = Arc::clone(&frame);
            let cache = Arc::clone(&cache);
            let stop = Arc::clone(&stop);
            let evaluated = Arc::clone(&evaluated);
            let tx = tx.clone();
            let matching = options.matching.clone();

            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                if stop.load(Ordering::Acquire) {
                    return;
                }
                let Some(template) = cache.scaled(factor) else {
                    debug!(factor, "scale skipped, no opaque pixels at this size");
                    return;
                };
                let mut result = match_template(&frame, &template, &matching);
                result.scale = factor;
                evaluated.fetch_add(1, Ordering::Relaxed);

                let qualifies = stop_score.is_some_and(|s| result.found && result.score >= s);
                let claimed_stop = qualifies
                    && stop
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                let _ = tx.send(Published { result, claimed_stop });
            }));
        }
        drop(tx);

        let mut best = MatchResult::not_found();
        let mut total_time: Option<Duration> = None;
        let mut stopped_early = false;
        while let Some(published) = rx.recv().await {
            if let Some(d) = published.result.duration {
                *total_time.get_or_insert(Duration::ZERO) += d;
            }
            if published.result.score > best.score {
                best = published.result;
            }
            if published.claimed_stop {
                stopped_early = true;
                break;
            }
        }

        if !stopped_early {
            for joined in join_all(handles).await {
                if let Err(err) = joined {
                    if err.is_panic() {
                        std::panic::resume_unwind(err.into_panic());
                    }
                }
            }
        }

        best.duration = total_time;
        best.scales_evaluated = evaluated.load(Ordering::Relaxed);
        debug!(
            score = best.score,
            scale = best.scale,
            found = best.found,
            scales_evaluated = best.scales_evaluated,
            stopped_early,
            "scale search complete"
        );
        best
    }
}
