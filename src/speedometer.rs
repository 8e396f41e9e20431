//! Transfer rate tracking and time-remaining estimates
//!
//! Rates are smoothed with an exponential moving average so a single slow or
//! bursty sample does not make the displayed speed jump around.

use std::time::Instant;

/// Weight of the newest sample in the moving average
pub const SMOOTHING_FACTOR: f64 = 0.05;

/// Seconds of runtime before an ETA is reported
pub const ETA_MIN_RUNTIME: u64 = 10;

/// Exponentially smoothed bytes-per-second meter
///
/// Samples are submitted between [`start`](Self::start) and
/// [`end`](Self::end). Each sample's instantaneous rate is the bytes divided
/// by the time since the previous sample.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
/// use usenet_engine::speedometer::Speedometer;
///
/// let mut meter = Speedometer::new();
/// let t0 = Instant::now();
/// meter.start_at(t0);
/// meter.submit_at(1000, t0 + Duration::from_secs(1));
/// assert!((meter.bps() - 50.0).abs() < 1e-9);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Speedometer {
    stamp: Option<Instant>,
    speed: f64,
    // bytes submitted within the same millisecond as the last stamp
    carry: u64,
}

impl Speedometer {
    /// New stopped meter
    pub fn new() -> Self {
        Self::default()
    }

    /// Start measuring now
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    /// Start measuring at `now`
    pub fn start_at(&mut self, now: Instant) {
        self.stamp = Some(now);
        self.carry = 0;
    }

    /// Submit a sample of `bytes` transferred since the previous sample
    pub fn submit(&mut self, bytes: u64) -> f64 {
        self.submit_at(bytes, Instant::now())
    }

    /// Submit a sample observed at `now`
    ///
    /// Submitting to a stopped meter starts it and records nothing.
    pub fn submit_at(&mut self, bytes: u64, now: Instant) -> f64 {
        let Some(stamp) = self.stamp else {
            self.start_at(now);
            return self.speed;
        };
        let millis = now.saturating_duration_since(stamp).as_millis();
        if millis == 0 {
            self.carry += bytes;
            return self.speed;
        }
        let secs = millis as f64 / 1000.0;
        let sample = (bytes + self.carry) as f64 / secs;
        self.speed = SMOOTHING_FACTOR * sample + (1.0 - SMOOTHING_FACTOR) * self.speed;
        self.stamp = Some(now);
        self.carry = 0;
        self.speed
    }

    /// Stop measuring and reset the rate
    pub fn end(&mut self) {
        self.stamp = None;
        self.speed = 0.0;
        self.carry = 0;
    }

    /// Current smoothed rate in bytes per second
    pub fn bps(&self) -> f64 {
        self.speed
    }

    /// Whether the meter has been started
    pub fn is_running(&self) -> bool {
        self.stamp.is_some()
    }
}

/// Estimate seconds remaining from elapsed runtime and percent complete
///
/// Returns `None` until the task has run for [`ETA_MIN_RUNTIME`] seconds and
/// made some progress, because earlier estimates are mostly noise.
pub fn estimate_eta(runtime_secs: u64, completion_pct: f64) -> Option<u64> {
    if runtime_secs < ETA_MIN_RUNTIME || completion_pct <= 0.0 {
        return None;
    }
    let completion = completion_pct.min(100.0);
    let per_percent = runtime_secs as f64 / completion;
    Some(((100.0 - completion) * per_percent) as u64)
}
