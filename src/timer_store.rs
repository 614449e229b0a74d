//! §4.2 — the ordered in-memory index of pending timers: a short wheel for
//! the near future, a long wheel for the rest of the day, and an overflow
//! structure for anything further out than that, plus a flat `id -> timer`
//! index for O(1) replace/delete.

use crate::timer::Timer;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Short-wheel granularity: one bucket covers 10ms.
const G_MS: u64 = 10;
/// Short-wheel bucket count: a ~10.24s horizon before spilling to the long wheel.
const SHORT_BUCKETS: usize = 1024;
/// Long-wheel bucket count: a ~11.65h horizon before spilling to the overflow set.
const LONG_BUCKETS: usize = 4096;
const SHORT_HORIZON_MS: u64 = SHORT_BUCKETS as u64 * G_MS;
const LONG_SLOT_MS: u64 = SHORT_HORIZON_MS;
const LONG_HORIZON_MS: u64 = LONG_BUCKETS as u64 * LONG_SLOT_MS;

#[derive(Debug, Clone, Copy)]
enum Location {
    Short(usize),
    Long(usize),
    Overflow,
}

struct Entry {
    timer: Timer,
    location: Location,
}

/// §4.2's "two-tier wheel plus overflow heap". The overflow tier is
/// implemented with a `BTreeSet` rather than a binary heap so a specific
/// id can be removed in O(log n) without scanning — required by
/// `delete_timer`'s O(1)-ish contract on top of the wheel's O(1) buckets.
pub struct TimerStore {
    short: Vec<VecDeque<u64>>,
    long: Vec<VecDeque<u64>>,
    overflow: BTreeSet<(u64, u64)>, // (next_pop_time, id)
    index: HashMap<u64, Entry>,
    cursor_ms: u64,
    short_idx: usize,
    long_idx: usize,
}

impl TimerStore {
    pub fn new(now_ms: u64) -> Self {
        TimerStore {
            short: (0..SHORT_BUCKETS).map(|_| VecDeque::new()).collect(),
            long: (0..LONG_BUCKETS).map(|_| VecDeque::new()).collect(),
            overflow: BTreeSet::new(),
            index: HashMap::new(),
            cursor_ms: now_ms - (now_ms % G_MS),
            short_idx: 0,
            long_idx: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Looks up a timer without removing it from the wheel.
    pub fn get(&self, id: u64) -> Option<&Timer> {
        self.index.get(&id).map(|e| &e.timer)
    }

    /// Earliest `next_pop_time` currently held, if any. Used by the
    /// dispatcher to compute its next wakeup (§4.5).
    pub fn earliest_pop_time(&self) -> Option<u64> {
        self.index.values().map(|e| e.timer.next_pop_time()).min()
    }

    /// Insert, or replace the existing entry with the same id (§4.2).
    pub fn add_timer(&mut self, timer: Timer) {
        self.delete_timer(timer.id);
        self.place(timer);
    }

    /// Remove by id, if present. Idempotent: returns whether anything was
    /// removed, never errors.
    pub fn delete_timer(&mut self, id: u64) -> bool {
        let Some(entry) = self.index.remove(&id) else {
            return false;
        };
        match entry.location {
            Location::Short(slot) => self.short[slot].retain(|&x| x != id),
            Location::Long(slot) => self.long[slot].retain(|&x| x != id),
            Location::Overflow => {
                self.overflow.remove(&(entry.timer.next_pop_time(), id));
            }
        }
        true
    }

    /// Drains every timer whose `next_pop_time <= now` into `out`,
    /// advancing the wheel tick by tick and opportunistically promoting
    /// long-wheel and overflow entries as the short wheel wraps (§4.2).
    pub fn get_next_timers(&mut self, now: u64, out: &mut Vec<Timer>) {
        while self.cursor_ms <= now {
            self.advance_one_tick(out);
        }
    }

    fn advance_one_tick(&mut self, out: &mut Vec<Timer>) {
        let due: Vec<u64> = self.short[self.short_idx].drain(..).collect();
        for id in due {
            if let Some(entry) = self.index.remove(&id) {
                out.push(entry.timer);
            }
        }

        self.cursor_ms += G_MS;
        self.short_idx = (self.short_idx + 1) % SHORT_BUCKETS;

        if self.short_idx == 0 {
            self.promote_long_bucket();
        }
    }

    fn promote_long_bucket(&mut self) {
        let ids: Vec<u64> = self.long[self.long_idx].drain(..).collect();
        for id in ids {
            if let Some(entry) = self.index.remove(&id) {
                self.place(entry.timer);
            }
        }
        self.long_idx = (self.long_idx + 1) % LONG_BUCKETS;

        let horizon = self.cursor_ms + LONG_HORIZON_MS;
        let ready: Vec<(u64, u64)> = self
            .overflow
            .range(..(horizon, u64::MAX))
            .cloned()
            .collect();
        for key @ (_, id) in ready {
            self.overflow.remove(&key);
            if let Some(entry) = self.index.remove(&id) {
                self.place(entry.timer);
            }
        }
    }

    fn place(&mut self, timer: Timer) {
        let id = timer.id;
        let pop_time = timer.next_pop_time();
        let delta = pop_time.saturating_sub(self.cursor_ms);

        let location = if delta < SHORT_HORIZON_MS {
            let slot = (self.short_idx + (delta / G_MS) as usize) % SHORT_BUCKETS;
            self.short[slot].push_back(id);
            Location::Short(slot)
        } else if delta < LONG_HORIZON_MS {
            let slot = (self.long_idx + (delta / LONG_SLOT_MS) as usize) % LONG_BUCKETS;
            self.long[slot].push_back(id);
            Location::Long(slot)
        } else {
            self.overflow.insert((pop_time, id));
            Location::Overflow
        };

        self.index.insert(id, Entry { timer, location });
    }
}
