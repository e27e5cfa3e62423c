use std::time::{Duration, Instant};

use super::QuantileSketch;

/// A set of sketches that together answer "what did the last `max_age` look like".
///
/// Every observation goes into every sketch. The head sketch is the oldest and is the
/// one read for quantiles. When it expires it is zeroed, becoming the newest, and the
/// next oldest sketch becomes the head.
#[derive(Debug)]
pub(crate) struct SketchWindow {
    sketches: Vec<QuantileSketch>,
    head: usize,
    head_expires: Instant,
    sketch_duration: Duration,
    max_age: Duration,
}

impl SketchWindow {
    pub fn new(scale: u8, max_age: Duration, age_buckets: u32, now: Instant) -> Self {
        let age_buckets = age_buckets.max(1);
        Self {
            sketches: (0..age_buckets).map(|_| QuantileSketch::new(scale)).collect(),
            head: 0,
            head_expires: now + max_age,
            sketch_duration: (max_age / age_buckets).max(Duration::from_nanos(1)),
            max_age,
        }
    }

    pub fn accumulate(&mut self, value: f64, now: Instant) {
        self.rotate(now);
        for sketch in &mut self.sketches {
            sketch.accumulate(value);
        }
    }

    pub fn quantile(&mut self, q: f64, now: Instant) -> f64 {
        self.rotate(now);
        self.sketches[self.head].quantile(q)
    }

    fn rotate(&mut self, now: Instant) {
        if now < self.head_expires {
            return;
        }
        if self.max_age <= now.duration_since(self.head_expires) {
            // idle for a whole window: nothing left to keep
            for sketch in &mut self.sketches {
                sketch.zero();
            }
            self.head = 0;
            self.head_expires = now + self.max_age;
            return;
        }
        while self.head_expires <= now {
            self.sketches[self.head].zero();
            self.head = (self.head + 1) % self.sketches.len();
            self.head_expires += self.sketch_duration;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::SketchWindow;

    #[test_log::test]
    fn observations_age_out() {
        let start = Instant::now();
        let mut window = SketchWindow::new(8, Duration::from_secs(10), 5, start);
        window.accumulate(100.0, start);

        let median = window.quantile(0.5, start + Duration::from_secs(5));
        assert!((median - 100.0).abs() < 1.0, "{median}");

        // the head rotates every 2 seconds after the first 10, and the last sketch
        // holding the observation is zeroed at 18 seconds
        let median = window.quantile(0.5, start + Duration::from_secs(16));
        assert!((median - 100.0).abs() < 1.0, "{median}");
        assert!(window
            .quantile(0.5, start + Duration::from_secs(18))
            .is_nan());
    }

    #[test_log::test]
    fn newer_observations_outlive_older_ones() {
        let start = Instant::now();
        let mut window = SketchWindow::new(8, Duration::from_secs(10), 5, start);
        window.accumulate(1.0, start);
        window.accumulate(1000.0, start + Duration::from_secs(11));

        // at 13s the head has not been zeroed since the start, so it holds both
        let max = window.quantile(1.0, start + Duration::from_secs(13));
        assert!((max - 1000.0).abs() < 10.0, "{max}");

        // by 18s every sketch holding the 1.0 has been zeroed; 1000 is still in the window
        let min = window.quantile(0.0, start + Duration::from_secs(18));
        assert!((min - 1000.0).abs() < 10.0, "{min}");
    }

    #[test_log::test]
    fn long_idle_clears_everything() {
        let start = Instant::now();
        let mut window = SketchWindow::new(8, Duration::from_secs(10), 5, start);
        window.accumulate(42.0, start);

        let later = start + Duration::from_secs(3600);
        assert!(window.quantile(0.5, later).is_nan());

        window.accumulate(7.0, later);
        let median = window.quantile(0.5, later + Duration::from_secs(1));
        assert!((median - 7.0).abs() < 0.1, "{median}");
    }
}
