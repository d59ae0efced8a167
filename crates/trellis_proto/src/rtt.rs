//! See [`RttEstimator`].

use web_time::Duration;

/// Smallest RTT delta worth folding into the estimate.
///
/// Samples inside this dead-band are ignored, which stops millisecond
/// jitter from wobbling resend timing.
const DEAD_BAND: Duration = Duration::from_millis(1);

/// Round-trip time estimate fed by cumulative-ack samples.
///
/// An exponential moving average, `rtt += alpha * (sample - rtt)`, with
/// `alpha = 2 / (window + 1)` - one sample per in-flight slot carries the
/// weight of a simple moving average over one window's worth of acks.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: Duration,
    latest: Duration,
    min: Duration,
    alpha: f64,
}

impl RttEstimator {
    /// Creates an estimator seeded with `initial` for a window of
    /// `window` packets.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // window <= 8
    pub fn new(initial: Duration, window: usize) -> Self {
        Self {
            smoothed: initial,
            latest: initial,
            min: initial,
            alpha: 2.0 / (window as f64 + 1.0),
        }
    }

    /// Current smoothed estimate.
    #[must_use]
    pub const fn get(&self) -> Duration {
        self.smoothed
    }

    /// Most recent sample observed.
    #[must_use]
    pub const fn latest(&self) -> Duration {
        self.latest
    }

    /// Smallest sample observed so far.
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Folds one ack round-trip sample into the estimate.
    ///
    /// # Example
    ///
    /// ```
    /// use web_time::Duration;
    /// use trellis_proto::rtt::RttEstimator;
    ///
    /// let mut rtt = RttEstimator::new(Duration::from_millis(100), 8);
    /// rtt.update(Duration::from_millis(190));
    /// assert_eq!(Duration::from_millis(120), rtt.get());
    /// assert_eq!(Duration::from_millis(100), rtt.min());
    /// ```
    pub fn update(&mut self, sample: Duration) {
        self.latest = sample;
        self.min = self.min.min(sample);

        let delta = if sample > self.smoothed {
            sample - self.smoothed
        } else {
            self.smoothed - sample
        };
        if delta < DEAD_BAND {
            return;
        }
        let smoothed = self.smoothed.as_secs_f64();
        self.smoothed =
            Duration::from_secs_f64(smoothed + self.alpha * (sample.as_secs_f64() - smoothed));
    }
}
