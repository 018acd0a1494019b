use medians::Medianf64;
use rolling_stats;
use serde::Serialize;
use statistical;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DescriptiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

/// `recent` covers the last N values; `session` covers everything since the
/// last reset.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ValueStats {
    pub recent: DescriptiveStats,
    pub session: DescriptiveStats,
}

pub struct ValueStatsAccumulator {
    pub value_stats: ValueStats,

    // State for `recent`.
    circular_buffer: CircularBuffer,

    // State for `session`.
    rolling_stats: rolling_stats::Stats<f64>,
}

impl ValueStatsAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            value_stats: ValueStats::default(),
            circular_buffer: CircularBuffer::new(capacity),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.circular_buffer.push(value);
        self.rolling_stats.update(value);

        let recent_values = self.circular_buffer.unordered_contents();
        let recent_stats = &mut self.value_stats.recent;
        recent_stats.min =
            *recent_values.iter().min_by(|a, b| a.total_cmp(b)).unwrap();
        recent_stats.max =
            *recent_values.iter().max_by(|a, b| a.total_cmp(b)).unwrap();
        recent_stats.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent_stats.stddev = statistical::standard_deviation(
                recent_values, Some(recent_stats.mean));
        }
        recent_stats.median = Some(recent_values.medf_unchecked());
        recent_stats.median_absolute_deviation =
            Some(recent_values.madf(recent_stats.median.unwrap()));

        let session_stats = &mut self.value_stats.session;
        session_stats.min = self.rolling_stats.min;
        session_stats.max = self.rolling_stats.max;
        session_stats.mean = self.rolling_stats.mean;
        session_stats.stddev = self.rolling_stats.std_dev;
        // No median or median_absolute_deviation for session_stats.
    }

    pub fn reset_session(&mut self) {
        self.value_stats.session = DescriptiveStats::default();
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
    }
}

// We use a Vec<f64> to implement a ring buffer. We don't use VecDeque or
// similar because we want a view of all elements as a single slice, and we
// don't care about their order (VecDeque provides a slice view, but as two
// slices to represent ordering).
//
// Implementation adapted from
// https://stackoverflow.com/questions/67841977/which-rust-structure-does-this
#[derive(Debug)]
struct CircularBuffer {
    start: usize,
    data: Vec<f64>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: f64) {
        if self.data.len() < self.data.capacity() {
            self.data.push(item);
        } else {
            self.data[self.start] = item;
            self.start += 1;
            self.start %= self.data.capacity();
        }
    }

    pub fn unordered_contents(&self) -> &[f64] {
        self.data.as_slice()
    }
}

/// Snapshot of guide loop quality for the status report.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GuideQuality {
    pub cycles: u64,
    pub failed_cycles: u64,

    /// Stats over the measured per-cycle pointing deltas, arcsec.
    pub ra: ValueStats,
    pub dec: ValueStats,
}

// How many recent cycles the `recent` stats cover.
const RECENT_CYCLES: usize = 20;

/// Accumulates per-axis pointing deltas measured by the guide loop.
pub struct GuideStats {
    ra: ValueStatsAccumulator,
    dec: ValueStatsAccumulator,
    cycles: u64,
    failed_cycles: u64,
}

impl GuideStats {
    pub fn new() -> Self {
        GuideStats {
            ra: ValueStatsAccumulator::new(RECENT_CYCLES),
            dec: ValueStatsAccumulator::new(RECENT_CYCLES),
            cycles: 0,
            failed_cycles: 0,
        }
    }

    /// Records one guide cycle's measured deltas, arcsec.
    pub fn add_cycle(&mut self, ra_arcsec: f64, dec_arcsec: f64) {
        self.cycles += 1;
        self.ra.add_value(ra_arcsec);
        self.dec.add_value(dec_arcsec);
    }

    /// Records a cycle that produced no usable measurement.
    pub fn add_failed_cycle(&mut self) {
        self.cycles += 1;
        self.failed_cycles += 1;
    }

    pub fn quality(&self) -> GuideQuality {
        GuideQuality {
            cycles: self.cycles,
            failed_cycles: self.failed_cycles,
            ra: self.ra.value_stats.clone(),
            dec: self.dec.value_stats.clone(),
        }
    }
}

impl Default for GuideStats {
    fn default() -> Self {
        Self::new()
    }
}

// mod tests.
