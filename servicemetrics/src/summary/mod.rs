//! Summaries for the prometheus registry.
//!
//! The prometheus crate ships counters, gauges and histograms but no summaries. A
//! [`SummaryVec`] is a [`Collector`] that fills that gap: cumulative count and sum, plus
//! quantiles over a sliding window.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use prometheus::{
    core::{Collector, Desc},
    proto,
};

mod sketch;
mod window;

pub use sketch::QuantileSketch;
use window::SketchWindow;

use crate::config::DEFAULT_OBJECTIVES;

/// Options for a [`SummaryVec`].
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOpts {
    pub name: String,
    pub help: String,
    /// Quantiles to report, each paired with its tolerated error.
    pub objectives: Vec<(f64, f64)>,
    /// How far back quantiles look.
    pub max_age: Duration,
    /// How many steps the window rotates through over `max_age`.
    pub age_buckets: u32,
}

impl SummaryOpts {
    /// Default objectives over a 10 minute window in 5 steps.
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            objectives: DEFAULT_OBJECTIVES.to_vec(),
            max_age: Duration::from_secs(600),
            age_buckets: 5,
        }
    }

    pub fn objectives(mut self, objectives: impl IntoIterator<Item = (f64, f64)>) -> Self {
        self.objectives = objectives.into_iter().collect();
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn age_buckets(mut self, age_buckets: u32) -> Self {
        self.age_buckets = age_buckets;
        self
    }
}

/// A family of summaries partitioned by label values.
///
/// Cloning shares the family, so a clone can be registered and the original kept for
/// recording.
#[derive(Debug, Clone)]
pub struct SummaryVec {
    family: Arc<SummaryFamily>,
}

#[derive(Debug)]
struct SummaryFamily {
    desc: Desc,
    label_names: Vec<String>,
    quantiles: Vec<f64>,
    scale: u8,
    max_age: Duration,
    age_buckets: u32,
    children: RwLock<BTreeMap<Vec<String>, Summary>>,
}

impl SummaryVec {
    pub fn new(opts: SummaryOpts, label_names: &[&str]) -> prometheus::Result<Self> {
        for (quantile, error) in &opts.objectives {
            if !(0.0 < *quantile && *quantile < 1.0) || !(0.0..=1.0).contains(error) {
                return Err(prometheus::Error::Msg(format!(
                    "invalid objective {quantile}: {error} for summary {}",
                    opts.name
                )));
            }
        }
        if opts.age_buckets == 0 || opts.max_age.is_zero() {
            return Err(prometheus::Error::Msg(format!(
                "summary {} needs a positive max_age and age_buckets",
                opts.name
            )));
        }

        let label_names: Vec<String> = label_names.iter().map(|name| name.to_string()).collect();
        let desc = Desc::new(
            opts.name.clone(),
            opts.help.clone(),
            label_names.clone(),
            HashMap::new(),
        )?;

        let mut quantiles: Vec<f64> = opts.objectives.iter().map(|(q, _)| *q).collect();
        quantiles.sort_by(f64::total_cmp);
        quantiles.dedup();
        let tightest_error = opts
            .objectives
            .iter()
            .map(|(_, error)| *error)
            .fold(f64::INFINITY, f64::min);

        Ok(Self {
            family: Arc::new(SummaryFamily {
                desc,
                label_names,
                quantiles,
                scale: QuantileSketch::scale_for_relative_error(tightest_error),
                max_age: opts.max_age,
                age_buckets: opts.age_buckets,
                children: Default::default(),
            }),
        })
    }

    /// Get or create the summary for these label values, in label name order.
    pub fn get_metric_with_label_values(&self, values: &[&str]) -> prometheus::Result<Summary> {
        if values.len() != self.family.label_names.len() {
            return Err(prometheus::Error::InconsistentCardinality {
                expect: self.family.label_names.len(),
                got: values.len(),
            });
        }
        let key: Vec<String> = values.iter().map(|value| value.to_string()).collect();
        if let Some(existing) = self
            .family
            .children
            .read()
            .expect("local lock should not be poisoned")
            .get(&key)
        {
            return Ok(existing.clone());
        }

        let mut children = self
            .family
            .children
            .write()
            .expect("local lock should not be poisoned");
        let family = &self.family;
        Ok(children
            .entry(key)
            .or_insert_with(|| {
                Summary::new(family.scale, family.max_age, family.age_buckets)
            })
            .clone())
    }

    /// Like [`SummaryVec::get_metric_with_label_values`], but panics on a label count
    /// mismatch - the same contract as the prometheus crate's vectors.
    pub fn with_label_values(&self, values: &[&str]) -> Summary {
        match self.get_metric_with_label_values(values) {
            Ok(summary) => summary,
            Err(e) => panic!("summary {}: {e}", self.family.desc.fq_name),
        }
    }

    fn collect_at(&self, now: Instant) -> proto::MetricFamily {
        let metrics: Vec<proto::Metric> = self
            .family
            .children
            .read()
            .expect("local lock should not be poisoned")
            .iter()
            .map(|(values, summary)| self.family.metric(values, summary, now))
            .collect();

        let mut family = proto::MetricFamily::default();
        family.set_name(self.family.desc.fq_name.clone());
        family.set_help(self.family.desc.help.clone());
        family.set_field_type(proto::MetricType::SUMMARY);
        family.set_metric(metrics.into());
        family
    }
}

impl SummaryFamily {
    fn metric(&self, values: &[String], summary: &Summary, now: Instant) -> proto::Metric {
        let mut labels: Vec<proto::LabelPair> = self
            .label_names
            .iter()
            .zip(values)
            .map(|(name, value)| {
                let mut pair = proto::LabelPair::default();
                pair.set_name(name.clone());
                pair.set_value(value.clone());
                pair
            })
            .collect();
        labels.sort_by(|a, b| a.get_name().cmp(b.get_name()));

        let snapshot = summary.snapshot_at(&self.quantiles, now);
        let quantiles: Vec<proto::Quantile> = snapshot
            .quantiles
            .into_iter()
            .map(|(quantile, value)| {
                let mut q = proto::Quantile::default();
                q.set_quantile(quantile);
                q.set_value(value);
                q
            })
            .collect();
        let mut proto_summary = proto::Summary::default();
        proto_summary.set_sample_count(snapshot.count);
        proto_summary.set_sample_sum(snapshot.sum);
        proto_summary.set_quantile(quantiles.into());

        let mut metric = proto::Metric::default();
        metric.set_label(labels.into());
        metric.set_summary(proto_summary);
        metric
    }
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.family.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        vec![self.collect_at(Instant::now())]
    }
}

/// One labeled summary. Cheap to clone; clones record into the same summary.
#[derive(Debug, Clone)]
pub struct Summary {
    state: Arc<Mutex<SummaryState>>,
}

#[derive(Debug)]
struct SummaryState {
    count: u64,
    sum: f64,
    window: SketchWindow,
}

/// A point-in-time view of a summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SummarySnapshot {
    pub count: u64,
    pub sum: f64,
    /// (quantile, value) pairs in ascending quantile order
    pub quantiles: Vec<(f64, f64)>,
}

impl Summary {
    fn new(scale: u8, max_age: Duration, age_buckets: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(SummaryState {
                count: 0,
                sum: 0.0,
                window: SketchWindow::new(scale, max_age, age_buckets, Instant::now()),
            })),
        }
    }

    /// Record one value. NaN is not a measurement and is ignored.
    pub fn observe(&self, value: f64) {
        self.observe_at(value, Instant::now())
    }

    fn observe_at(&self, value: f64, now: Instant) {
        if value.is_nan() {
            return;
        }
        let mut state = self
            .state
            .lock()
            .expect("local mutex should not be poisoned");
        state.count += 1;
        state.sum += value;
        state.window.accumulate(value, now);
    }

    /// Observations since creation
    pub fn get_sample_count(&self) -> u64 {
        self.state
            .lock()
            .expect("local mutex should not be poisoned")
            .count
    }

    /// Sum of observations since creation
    pub fn get_sample_sum(&self) -> f64 {
        self.state
            .lock()
            .expect("local mutex should not be poisoned")
            .sum
    }

    fn snapshot_at(&self, quantiles: &[f64], now: Instant) -> SummarySnapshot {
        let mut state = self
            .state
            .lock()
            .expect("local mutex should not be poisoned");
        SummarySnapshot {
            count: state.count,
            sum: state.sum,
            quantiles: quantiles
                .iter()
                .map(|q| (*q, state.window.quantile(*q, now)))
                .collect(),
        }
    }
}
