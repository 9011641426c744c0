//! Coordinate aggregation
//!
//! Holds the latest value of every input channel plus the set of channels
//! currently held by a producer. Producers write from any thread; the
//! telemetry transmitter reads consistent snapshots.

use crate::domain::errors::{SessionError, SessionResult};
use crate::domain::models::ChannelSnapshot;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Default number of channels on the keyboard surface
pub const DEFAULT_CHANNEL_COUNT: usize = 7;

/// Default upper bound of a channel value
pub const DEFAULT_CHANNEL_MAX: i32 = 300;

#[derive(Debug)]
struct ChannelState {
    values: Vec<i32>,
    active: BTreeSet<usize>,
}

#[derive(Debug)]
pub struct CoordinateAggregator {
    state: Mutex<ChannelState>,
    count: usize,
    max: i32,
}

impl CoordinateAggregator {
    pub fn new(count: usize, max: i32) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                values: vec![0; count],
                active: BTreeSet::new(),
            }),
            count,
            max: max.max(0),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.count
    }

    pub fn max_value(&self) -> i32 {
        self.max
    }

    /// Store a value for a channel and mark it active.
    ///
    /// The value is clamped into `0..=max`.
    pub fn set_channel(&self, index: usize, value: i32) -> SessionResult<()> {
        self.check_index(index)?;
        let value = value.clamp(0, self.max);

        let mut state = self.lock();
        state.values[index] = value;
        state.active.insert(index);
        trace!("Channel {} set to {}", index, value);
        Ok(())
    }

    /// Zero a channel and drop it from the active set
    pub fn release_channel(&self, index: usize) -> SessionResult<()> {
        self.check_index(index)?;

        let mut state = self.lock();
        state.values[index] = 0;
        state.active.remove(&index);
        trace!("Channel {} released", index);
        Ok(())
    }

    /// Release every channel at once
    pub fn clear(&self) {
        let mut state = self.lock();
        state.values.iter_mut().for_each(|v| *v = 0);
        state.active.clear();
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let state = self.lock();
        ChannelSnapshot {
            values: state.values.clone(),
            any_active: !state.active.is_empty(),
        }
    }

    fn check_index(&self, index: usize) -> SessionResult<()> {
        if index >= self.count {
            return Err(SessionError::IndexOutOfRange {
                index,
                count: self.count,
            });
        }
        Ok(())
    }

    // Poison is ignored: no update can leave the state half-written.
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CoordinateAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_COUNT, DEFAULT_CHANNEL_MAX)
    }
}
