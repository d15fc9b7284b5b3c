//! Downstream aggregation of published measurements
//!
//! Fills the derived `Measurement` fields the acquisition loop leaves alone: two
//! smoothed AC power averages and the lifetime energy at the last local day
//! boundary. Runs on the consumer side, after `MeasurementSubscriber::changed`.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone};
use log::{debug, info};

use crate::measurement::Measurement;

/// Short average window
pub const SHORT_WINDOW: Duration = Duration::from_secs(60);
/// Long average window
pub const LONG_WINDOW: Duration = Duration::from_secs(6 * 60);

/// Exponentially smoothed average over a window of `window` samples
///
/// The ready flag goes up every time `window` samples have been added since it was
/// last raised, and stays up until taken.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingAverage {
    window: u32,
    samples: u32,
    value: f32,
    ready: bool,
    primed: bool,
}

impl RollingAverage {
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            samples: 0,
            value: 0.0,
            ready: false,
            primed: false,
        }
    }

    /// Window length for `period` at one sample per `poll_interval`
    pub fn for_period(period: Duration, poll_interval: Duration) -> Self {
        let interval_ms = poll_interval.as_millis().max(1);
        let window = (period.as_millis() / interval_ms).clamp(1, u32::MAX as u128) as u32;
        Self::new(window)
    }

    pub fn push(&mut self, sample: f32) {
        if self.primed {
            self.value += (sample - self.value) / self.window as f32;
        } else {
            self.value = sample;
            self.primed = true;
        }

        self.samples += 1;
        if self.samples >= self.window {
            self.samples = 0;
            self.ready = true;
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Consume the ready flag
    pub fn take_ready(&mut self) -> bool {
        std::mem::take(&mut self.ready)
    }
}

/// Lifetime energy seen at the start of the current local day
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyEnergy {
    day: Option<NaiveDate>,
    baseline_wh: f32,
}

impl DailyEnergy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the lifetime counter; rebases on a new day or a counter reset
    pub fn update<Tz: TimeZone>(&mut self, lifetime_wh: f32, now: &DateTime<Tz>) {
        let today = now.date_naive();

        match self.day {
            Some(day) if day == today && lifetime_wh >= self.baseline_wh => {}
            Some(day) if day == today => {
                info!("Lifetime energy went backwards, rebasing daily production");
                self.baseline_wh = lifetime_wh;
            }
            _ => {
                debug!("Daily energy baseline for {}: {} Wh", today, lifetime_wh);
                self.day = Some(today);
                self.baseline_wh = lifetime_wh;
            }
        }
    }

    pub fn baseline_wh(&self) -> f32 {
        self.baseline_wh
    }

    pub fn day(&self) -> Option<NaiveDate> {
        self.day
    }

    /// Production since the day boundary
    pub fn today_wh(&self, lifetime_wh: f32) -> f32 {
        (lifetime_wh - self.baseline_wh).max(0.0)
    }
}

/// Fills all derived fields of a measurement stream
#[derive(Debug, Clone)]
pub struct Aggregator {
    short: RollingAverage,
    long: RollingAverage,
    daily: DailyEnergy,
}

impl Aggregator {
    /// Windows sized for one measurement per `poll_interval`
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_windows(
            RollingAverage::for_period(SHORT_WINDOW, poll_interval),
            RollingAverage::for_period(LONG_WINDOW, poll_interval),
        )
    }

    pub fn with_windows(short: RollingAverage, long: RollingAverage) -> Self {
        Self {
            short,
            long,
            daily: DailyEnergy::new(),
        }
    }

    /// Account for `measurement` and write the derived fields into it
    ///
    /// Ready flags are only ever raised here; clearing them is up to whoever
    /// consumes the averages.
    pub fn apply<Tz: TimeZone>(&mut self, measurement: &mut Measurement, now: &DateTime<Tz>) {
        self.short.push(measurement.ac_power);
        self.long.push(measurement.ac_power);

        measurement.avg_power_1h = self.short.value();
        if self.short.take_ready() {
            measurement.power_1h_ready = true;
        }

        measurement.avg_power_24h = self.long.value();
        if self.long.take_ready() {
            measurement.power_24h_ready = true;
        }

        self.daily.update(measurement.ac_energy_wh, now);
        measurement.energy_wh_at_day_start = self.daily.baseline_wh();
    }

    pub fn daily(&self) -> &DailyEnergy {
        &self.daily
    }
}
