use exponential_histogram::ExponentialHistogram;

const MIN_SCALE: u8 = 2;
const MAX_SCALE: u8 = 8;

/// Observations are recorded in thousandths of their unit: the histogram's smallest
/// bucket starts at 1, and millisecond latencies need sub-millisecond resolution.
const SUB_UNITS: f64 = 1_000.0;

/// Octaves of range kept at the requested scale before the histogram zooms out.
/// 24 octaves of microseconds spans 1us to about 16s around the first observation.
const OCTAVES_AT_SCALE: u16 = 24;

/// A log-bucketed distribution for estimating quantiles with bounded relative error.
///
/// Positive observations go into an [`ExponentialHistogram`]. Zero and negative
/// observations have no bucket there, so they are counted together and report as 0.
#[derive(Debug)]
pub struct QuantileSketch {
    histogram: ExponentialHistogram,
    non_positive: u64,
}

impl QuantileSketch {
    pub fn new(scale: u8) -> Self {
        let scale = scale.clamp(MIN_SCALE, MAX_SCALE);
        Self {
            histogram: ExponentialHistogram::new_with_max_buckets(
                scale,
                OCTAVES_AT_SCALE << scale,
            ),
            non_positive: 0,
        }
    }

    /// The coarsest scale whose quantile estimates stay within `error` of the true value,
    /// relative to that value. Falls back to the finest supported scale.
    pub fn scale_for_relative_error(error: f64) -> u8 {
        (MIN_SCALE..=MAX_SCALE)
            .find(|scale| relative_error(*scale) <= error)
            .unwrap_or(MAX_SCALE)
    }

    /// The scale buckets currently have. Drops below the requested scale only when the
    /// observed range outgrows the bucket budget.
    pub fn scale(&self) -> u8 {
        self.histogram.scale()
    }

    pub fn count(&self) -> u64 {
        self.non_positive + self.histogram.count() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// NaN is not a position in the distribution, so it is ignored.
    pub fn accumulate(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        if value <= 0.0 {
            self.non_positive += 1;
        } else {
            self.histogram.accumulate(value * SUB_UNITS);
        }
    }

    /// Reset the sketch to an empty initial state
    pub fn zero(&mut self) {
        self.histogram.reset();
        self.non_positive = 0;
    }

    /// Estimate the value at quantile `q`. An empty sketch has no quantiles and returns NaN.
    pub fn quantile(&self, q: f64) -> f64 {
        let count = self.count();
        if count == 0 {
            return f64::NAN;
        }
        let rank = ((q * count as f64).ceil() as u64).clamp(1, count);

        let mut seen = self.non_positive;
        if rank <= seen {
            return 0.0;
        }
        let growth = bucket_growth(self.histogram.scale());
        let mut last_lower = None;
        for (lower, bucket_count) in self.histogram.value_counts() {
            if bucket_count == 0 {
                continue;
            }
            seen += bucket_count as u64;
            if rank <= seen {
                return representative_value(lower, growth) / SUB_UNITS;
            }
            last_lower = Some(lower);
        }

        // counts always cover the rank; this only happens if they were corrupted
        last_lower
            .map(|lower| representative_value(lower, growth) / SUB_UNITS)
            .unwrap_or_default()
    }
}

/// Ratio of a bucket's upper boundary to its lower boundary.
fn bucket_growth(scale: u8) -> f64 {
    2_f64.powf(2_f64.powi(-i32::from(scale)))
}

/// The harmonic mean of the bucket's boundaries: equally far, relatively, from both ends.
fn representative_value(lower: f64, growth: f64) -> f64 {
    2.0 * growth * lower / (1.0 + growth)
}

fn relative_error(scale: u8) -> f64 {
    let growth = bucket_growth(scale);
    (growth - 1.0) / (growth + 1.0)
}

#[cfg(test)]
mod test {
    use super::{relative_error, QuantileSketch};

    fn assert_close(expected: f64, actual: f64, relative: f64) {
        assert!(
            (expected - actual).abs() <= expected.abs() * relative,
            "expected {expected} within {relative} but got {actual}"
        );
    }

    #[test_log::test]
    fn scale_follows_error() {
        assert_eq!(2, QuantileSketch::scale_for_relative_error(0.1));
        assert_eq!(3, QuantileSketch::scale_for_relative_error(0.05));
        assert_eq!(6, QuantileSketch::scale_for_relative_error(0.01));
        assert_eq!(8, QuantileSketch::scale_for_relative_error(0.001));
        assert_eq!(8, QuantileSketch::scale_for_relative_error(0.0));
        assert!(relative_error(8) < relative_error(2));
    }

    #[test_log::test]
    fn requested_scale_is_clamped() {
        assert_eq!(2, QuantileSketch::new(0).scale());
        assert_eq!(8, QuantileSketch::new(20).scale());
    }

    #[test_log::test]
    fn empty_sketch_has_no_quantiles() {
        let sketch = QuantileSketch::new(8);
        assert!(sketch.quantile(0.5).is_nan());
        assert!(sketch.is_empty());
    }

    #[test_log::test]
    fn quantiles_of_a_uniform_range() {
        let mut sketch = QuantileSketch::new(8);
        for i in 1..=1000 {
            sketch.accumulate(i as f64);
        }
        assert_eq!(1000, sketch.count());
        assert_eq!(8, sketch.scale(), "the range fits without zooming out");
        assert_close(500.0, sketch.quantile(0.5), 0.01);
        assert_close(900.0, sketch.quantile(0.9), 0.01);
        assert_close(990.0, sketch.quantile(0.99), 0.01);
        assert_close(1.0, sketch.quantile(0.0), 0.01);
        assert_close(1000.0, sketch.quantile(1.0), 0.01);
    }

    #[test_log::test]
    fn coarse_scale_stays_within_its_error() {
        let mut sketch = QuantileSketch::new(3);
        for i in 1..=1000 {
            sketch.accumulate(i as f64);
        }
        // a value on a bucket edge can land one bucket low, so allow twice the bound
        assert_close(500.0, sketch.quantile(0.5), 2.0 * relative_error(3));
    }

    #[test_log::test]
    fn sub_unit_values() {
        let mut sketch = QuantileSketch::new(8);
        for value in [0.01, 0.02, 0.03, 0.04] {
            sketch.accumulate(value);
        }
        assert_close(0.02, sketch.quantile(0.5), 0.01);
        assert_close(0.04, sketch.quantile(1.0), 0.01);
    }

    #[test_log::test]
    fn zeros_and_negatives_report_as_zero() {
        let mut sketch = QuantileSketch::new(8);
        for value in [-20.0, 0.0, 10.0, 20.0] {
            sketch.accumulate(value);
        }
        assert_eq!(4, sketch.count());
        assert_eq!(0.0, sketch.quantile(0.25));
        assert_eq!(0.0, sketch.quantile(0.5));
        assert_close(10.0, sketch.quantile(0.75), 0.01);
        assert_close(20.0, sketch.quantile(1.0), 0.01);
    }

    #[test_log::test]
    fn nan_is_ignored_and_zero_resets() {
        let mut sketch = QuantileSketch::new(8);
        sketch.accumulate(f64::NAN);
        assert!(sketch.is_empty());

        sketch.accumulate(42.0);
        sketch.accumulate(0.0);
        assert_eq!(2, sketch.count());
        sketch.zero();
        assert!(sketch.is_empty());
        assert!(sketch.quantile(0.9).is_nan());
    }
}
