use std::time::Duration;

/// Fixed-size window over the most recent `N` duration samples, keeping running sums so that mean
///  and standard deviation (jitter) are O(1).
pub struct RollingStats<const N: usize> {
    buf: Vec<f64>,
    next: usize,
    cached_sum: f64,
    cached_square_sum: f64,
}
impl<const N: usize> RollingStats<N> {
    pub fn new() -> Self {
        RollingStats {
            buf: Vec::with_capacity(N),
            next: 0,
            cached_sum: 0.0,
            cached_square_sum: 0.0,
        }
    }

    pub fn add(&mut self, sample: Duration) {
        let value = sample.as_secs_f64();

        if self.buf.len() < N {
            self.buf.push(value);
        }
        else {
            let evicted = self.buf[self.next];
            self.buf[self.next] = value;
            self.next = (self.next + 1) % N;
            self.cached_sum -= evicted;
            self.cached_square_sum -= evicted * evicted;
        }

        self.cached_sum += value;
        self.cached_square_sum += value * value;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.buf.is_empty() {
            return None;
        }
        Some(Duration::from_secs_f64((self.cached_sum / self.buf.len() as f64).max(0.0)))
    }

    pub fn std_dev(&self) -> Duration {
        if self.buf.len() < 2 {
            return Duration::ZERO;
        }

        let n = self.buf.len() as f64;
        let mean = self.cached_sum / n;
        let diff_of_squares = self.cached_square_sum - mean * mean * n;

        // running sums can drift slightly negative
        Duration::from_secs_f64((diff_of_squares / (n - 1.0)).max(0.0).sqrt())
    }
}

impl<const N: usize> Default for RollingStats<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_empty() {
        let stats = RollingStats::<4>::new();
        assert!(stats.mean().is_none());
        assert_eq!(stats.std_dev(), Duration::ZERO);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut stats = RollingStats::<3>::new();
        for v in [100, 10, 20, 30] {
            stats.add(ms(v));
        }
        assert_eq!(stats.len(), 3);
        let mean = stats.mean().unwrap();
        assert!((mean.as_secs_f64() - 0.020).abs() < 1e-9);
    }

    #[test]
    fn test_std_dev() {
        let mut stats = RollingStats::<8>::new();
        for v in [10, 20, 30] {
            stats.add(ms(v));
        }
        assert!((stats.std_dev().as_secs_f64() - 0.010).abs() < 1e-9);

        let mut constant = RollingStats::<8>::new();
        for _ in 0..5 {
            constant.add(ms(42));
        }
        assert!(constant.std_dev() < Duration::from_micros(1));
    }
}
