//! §4.4, EXPANSION 5 — per-timer consecutive-failure counting. Chronos wires
//! a real ITU alarm object past a threshold (`original_source/src/main/main.cpp`
//! constructs a `CHRONOS_TIMER_POP_ERROR` alarm and passes it into
//! `HTTPCallback`); this crate has no monitoring transport to raise it on,
//! so crossing the threshold is logged at verbosity 0 instead.

use crate::logging::{self, PrintSender};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct AlarmTracker {
    threshold: u32,
    counts: DashMap<u64, AtomicU32>,
}

impl AlarmTracker {
    pub fn new(threshold: u32) -> Self {
        AlarmTracker {
            threshold,
            counts: DashMap::new(),
        }
    }

    /// Records one pop's outcome for `id`. On success the counter resets;
    /// on failure it increments, and once it reaches `threshold` the alarm
    /// fires (logged) and the counter resets so it can fire again after
    /// another run of failures.
    pub async fn record(&self, id: u64, success: bool, print_tx: &PrintSender) {
        if success {
            self.counts.remove(&id);
            return;
        }

        let entry = self.counts.entry(id).or_insert_with(|| AtomicU32::new(0));
        let count = entry.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.threshold {
            logging::warn(
                print_tx,
                format!(
                    "alarm: timer {id} failed its callback {count} times in a row"
                ),
            )
            .await;
            entry.store(0, Ordering::Relaxed);
        }
    }
}
