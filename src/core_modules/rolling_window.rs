// THEORY:
// The motion detector compares each frame's change against "how much things
// usually change". That reference is the mean and standard deviation of the
// last N per-frame differences. The `RollingWindow` keeps those N samples in a
// ring and updates the statistics in O(1) per sample with Welford's running
// formulas, sliding them when the oldest sample is evicted.
//
// Removal can drift the running sum of squares slightly below zero after many
// evictions; it is clamped at zero so the deviation is always real.

#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: Vec<f64>,
    capacity: usize,
    head: usize,
    len: usize,
    mean: f64,
    m2: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RollingWindow {
            samples: vec![0.0; capacity],
            capacity,
            head: 0,
            len: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.len == self.capacity {
            let evicted = self.samples[self.head];
            self.samples[self.head] = value;
            self.head = (self.head + 1) % self.capacity;
            // Replace `evicted` by `value` with the count unchanged.
            let old_mean = self.mean;
            self.mean += (value - evicted) / self.len as f64;
            self.m2 += (value - evicted) * (value - self.mean + evicted - old_mean);
        } else {
            let tail = (self.head + self.len) % self.capacity;
            self.samples[tail] = value;
            self.len += 1;
            let delta = value - self.mean;
            self.mean += delta / self.len as f64;
            self.m2 += delta * (value - self.mean);
        }
        if self.m2 < 0.0 {
            self.m2 = 0.0;
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample standard deviation (n - 1); zero with fewer than two samples.
    pub fn std_dev(&self) -> f64 {
        if self.len < 2 {
            return 0.0;
        }
        (self.m2 / (self.len - 1) as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var.sqrt())
    }

    #[test]
    fn sliding_statistics_match_a_direct_computation() {
        let mut window = RollingWindow::new(20);
        let mut history = Vec::new();
        for i in 0..137 {
            let v = ((i * 7919) % 101) as f64 * 0.37 + (i % 5) as f64;
            window.push(v);
            history.push(v);
            if history.len() >= 2 {
                let tail = &history[history.len().saturating_sub(20)..];
                let (mean, std) = naive(tail);
                assert!((window.mean() - mean).abs() < 1e-9, "mean at {i}");
                assert!((window.std_dev() - std).abs() < 1e-7, "std at {i}");
            }
        }
        assert_eq!(window.len(), 20);
    }

    #[test]
    fn constant_input_has_zero_deviation() {
        let mut window = RollingWindow::new(5);
        for _ in 0..50 {
            window.push(3.25);
        }
        assert_eq!(window.mean(), 3.25);
        assert_eq!(window.std_dev(), 0.0);
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.std_dev(), 0.0);
    }
}
