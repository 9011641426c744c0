use crate::domain::channels::CoordinateAggregator;
use crate::domain::errors::SessionResult;
use std::sync::Arc;
use tracing::debug;

/// Touch input surface made of one horizontal strip per channel.
///
/// Raw pointer positions are in surface pixels; they are normalized
/// into the aggregator's value range before being stored.
pub struct TouchSurface {
    aggregator: Arc<CoordinateAggregator>,
    width: f64,
    inset: f64,
}

impl TouchSurface {
    pub fn new(aggregator: Arc<CoordinateAggregator>, width: f64, inset: f64) -> Self {
        Self {
            aggregator,
            width,
            inset,
        }
    }

    pub fn on_touch_begin(&self, channel: usize, raw_x: f64) -> SessionResult<()> {
        debug!("Touch begin on channel {} at {:.1}", channel, raw_x);
        self.aggregator.set_channel(channel, self.normalize(raw_x))
    }

    pub fn on_touch_move(&self, channel: usize, raw_x: f64) -> SessionResult<()> {
        self.aggregator.set_channel(channel, self.normalize(raw_x))
    }

    pub fn on_touch_end(&self, channel: usize) -> SessionResult<()> {
        debug!("Touch end on channel {}", channel);
        self.aggregator.release_channel(channel)
    }

    /// Gesture interrupted by the system; treated exactly like a lift
    pub fn on_touch_cancel(&self, channel: usize) -> SessionResult<()> {
        debug!("Touch cancelled on channel {}", channel);
        self.aggregator.release_channel(channel)
    }

    /// Map a pixel position to `0..=max` of the aggregator
    pub fn normalize(&self, raw_x: f64) -> i32 {
        let span = self.width - self.inset;
        // Avoid division by zero
        let span = if span <= 0.0 { 1.0 } else { span };
        let max = self.aggregator.max_value() as f64;

        let value = (raw_x / span * max).round();
        if value.is_nan() {
            return 0;
        }
        value.clamp(0.0, max) as i32
    }
}

impl Drop for TouchSurface {
    fn drop(&mut self) {
        // No strip may stay latched once the surface is gone
        self.aggregator.clear();
    }
}
