use std::{
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::HistogramVec;

use crate::{
    get_desc,
    log_distribution_with_labels,
    MetricLabel,
};

/// Status timer that defaults to error unless `.finish()` is explicitly called
/// upon success.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: Vec<MetricLabel>,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            labels: vec![MetricLabel::STATUS_ERROR],
        }
    }

    /// Finish the timer with status success
    pub fn finish(mut self) -> Duration {
        self.replace_label(MetricLabel::STATUS_ERROR, MetricLabel::STATUS_SUCCESS);
        self.start.elapsed()
    }

    fn replace_label(&mut self, old: MetricLabel, new: MetricLabel) {
        self.labels.retain(|l| *l != old);
        self.labels.push(new);
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed_duration = self.start.elapsed();
        let desc = get_desc(self.histogram);
        tracing::debug!("{elapsed_duration:?} for timer {desc:?} {:?}", self.labels);
        let labels = mem::take(&mut self.labels);
        log_distribution_with_labels(self.histogram, elapsed_duration.as_secs_f64(), labels);
    }
}
