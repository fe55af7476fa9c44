//! Pipelined point-by-point acquisition
//!
//! Composes a position sequence with a gated counter. Each step finishes the
//! gate in flight, pulls (and moves to) the next position, fires its gate and
//! only then hands the finished value to the consumer, so the next dwell runs
//! while the consumer redraws.

use log::debug;

use crate::counter::{count_rate, CounterHandle};
use crate::error::ScanError;
use crate::types::Position;

/// Lazy sequence of count rates, one per position, in position order
pub struct PixelStream<P>
where
    P: Iterator<Item = Result<Position, ScanError>>,
{
    positions: P,
    counter: CounterHandle,
    started: bool,
    in_flight: bool,
    pending_error: Option<ScanError>,
    done: bool,
    delivered: usize,
}

impl<P> PixelStream<P>
where
    P: Iterator<Item = Result<Position, ScanError>>,
{
    pub fn new(positions: P, counter: CounterHandle) -> Self {
        Self {
            positions,
            counter,
            started: false,
            in_flight: false,
            pending_error: None,
            done: false,
            delivered: 0,
        }
    }

    /// Number of rates handed out so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Measure the first position synchronously; `None` if there are no positions
    fn first_value(&mut self) -> Option<Result<f64, ScanError>> {
        match self.positions.next()? {
            Ok(position) => {
                debug!("First pixel at {:?}", position);
                Some(self.counter.count_rate())
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn finish_in_flight(&mut self) -> Result<f64, ScanError> {
        self.in_flight = false;
        let count = self.counter.finish()?;
        Ok(count_rate(count, self.counter.dwell()))
    }

    /// Pull the next position and fire its gate. Failures are held back until
    /// the value already measured has been delivered.
    fn advance(&mut self) {
        match self.positions.next() {
            Some(Ok(_)) => match self.counter.start() {
                Ok(()) => self.in_flight = true,
                Err(e) => self.pending_error = Some(e),
            },
            Some(Err(e)) => self.pending_error = Some(e),
            None => self.done = true,
        }
    }

    fn fail(&mut self, e: ScanError) -> Option<Result<f64, ScanError>> {
        debug!("Pixel stream stopped after {} pixels: {e}", self.delivered);
        self.done = true;
        self.counter.release();
        Some(Err(e))
    }
}

impl<P> Iterator for PixelStream<P>
where
    P: Iterator<Item = Result<Position, ScanError>>,
{
    type Item = Result<f64, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return self.fail(e);
        }
        if self.done {
            return None;
        }

        let value = if self.in_flight {
            self.finish_in_flight()
        } else if !self.started {
            self.started = true;
            match self.first_value() {
                Some(value) => value,
                None => {
                    self.done = true;
                    return None;
                }
            }
        } else {
            self.done = true;
            return None;
        };

        match value {
            Ok(rate) => {
                self.advance();
                self.delivered += 1;
                Some(Ok(rate))
            }
            Err(e) => self.fail(e),
        }
    }
}
