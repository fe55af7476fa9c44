//! Free-running count-rate monitor
//!
//! Counts one gate after another with no galvo motion, for aligning the
//! optics. Samples go into a [`RateHistory`] that can be capped to the most
//! recent N points.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

use crate::counter::CounterHandle;
use crate::error::ScanError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    /// Seconds since the monitor started
    pub elapsed_s: f64,
    /// Counts per second
    pub rate: f64,
}

/// Endless sequence of synchronous count-rate measurements
pub struct RateMonitor {
    counter: CounterHandle,
    start: Instant,
    done: bool,
}

impl RateMonitor {
    pub fn new(counter: CounterHandle) -> Self {
        Self {
            counter,
            start: Instant::now(),
            done: false,
        }
    }
}

impl Iterator for RateMonitor {
    type Item = Result<RateSample, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.counter.count_rate() {
            Ok(rate) => Some(Ok(RateSample {
                elapsed_s: self.start.elapsed().as_secs_f64(),
                rate,
            })),
            Err(e) => {
                debug!("Rate monitor stopped: {e}");
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Recent samples, optionally limited to the last `limit` points
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateHistory {
    samples: VecDeque<RateSample>,
    limit: Option<usize>,
}

impl RateHistory {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, sample: RateSample) {
        self.samples.push_back(sample);
        self.trim();
    }

    /// Change the cap, dropping the oldest samples if needed
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
        self.trim();
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn rates(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.rate).collect()
    }

    pub fn samples(&self) -> impl Iterator<Item = &RateSample> {
        self.samples.iter()
    }

    pub fn mean_rate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|s| s.rate).sum::<f64>() / self.samples.len() as f64)
    }

    fn trim(&mut self) {
        if let Some(limit) = self.limit {
            while self.samples.len() > limit {
                self.samples.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::GatedCounter;
    use crate::hardware::SimulatedDaq;
    use std::time::Duration;

    fn monitor(daq: &mut SimulatedDaq) -> RateMonitor {
        let handle = GatedCounter::new("Dev1/ctr1", "Dev1/ctr0")
            .configure(daq, Duration::from_millis(100))
            .unwrap();
        RateMonitor::new(handle)
    }

    #[test]
    fn test_monitor_yields_rates() {
        let mut daq = SimulatedDaq::new().with_counts(|gate| 10 * (gate as u32 + 1));
        let samples: Vec<RateSample> = monitor(&mut daq)
            .take(3)
            .collect::<Result<_, _>>()
            .unwrap();

        let rates: Vec<f64> = samples.iter().map(|s| s.rate.round()).collect();
        assert_eq!(rates, vec![100.0, 200.0, 300.0]);
        assert!(samples.windows(2).all(|w| w[0].elapsed_s <= w[1].elapsed_s));
    }

    #[test]
    fn test_monitor_stops_on_fault() {
        let mut daq = SimulatedDaq::new().timeout_at_gate(1);
        let mut monitor = monitor(&mut daq);
        assert!(monitor.next().unwrap().is_ok());
        assert!(matches!(monitor.next(), Some(Err(ScanError::Timeout { .. }))));
        assert!(monitor.next().is_none());
    }

    #[test]
    fn test_history_limit() {
        let mut history = RateHistory::new(None);
        for i in 0..5 {
            history.push(RateSample {
                elapsed_s: i as f64,
                rate: i as f64 * 10.0,
            });
        }
        assert_eq!(history.len(), 5);
        assert_eq!(history.mean_rate(), Some(20.0));

        history.set_limit(Some(2));
        assert_eq!(history.rates(), vec![30.0, 40.0]);

        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.mean_rate(), None);
    }
}
