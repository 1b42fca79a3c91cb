// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hashed timing wheel driving idle-connection reaping.
//!
//! A bounded ring of slots advances one position per tick; ticks arrive as
//! `SIGALRM` through the signal funnel. An entry whose interval spans more
//! than a full revolution carries a residual `rotation` count and is skipped
//! until it reaches zero. Insertion and removal are O(1) amortised; a tick
//! costs the number of entries filed in the current slot.

use std::cmp;
use std::mem;

use slab::Slab;

/// Default number of slots in the ring.
pub const DEFAULT_SLOTS: usize = 60;

/// Default seconds per slot.
pub const DEFAULT_STEP_SECS: u64 = 1;

/// Work to run when an entry expires.
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Stable handle to a filed timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey(usize);

struct TimerEntry {
    interval: u64,
    rotation: usize,
    slot: usize,
    valid: bool,
    looping: bool,
    callback: TimerCallback,
}

/// The wheel. Sole owner of its entries; everyone else holds [`TimerKey`]s.
pub struct TimerWheel {
    slots: Vec<Vec<usize>>,
    entries: Slab<TimerEntry>,
    current: usize,
    step_secs: u64,
}

impl TimerWheel {
    /// Creates a wheel of `slots` positions, each `step_secs` wide.
    pub fn new(slots: usize, step_secs: u64) -> Self {
        assert!(slots > 0, "wheel needs at least one slot");
        assert!(step_secs > 0, "slot width must be non-zero");
        Self {
            slots: (0..slots).map(|_| Vec::new()).collect(),
            entries: Slab::new(),
            current: 0,
            step_secs,
        }
    }

    /// Seconds per slot.
    pub fn step_secs(&self) -> u64 {
        self.step_secs
    }

    /// Index of the slot the next tick will fire.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are filed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries filed in `slot`.
    pub fn slot_len(&self, slot: usize) -> usize {
        self.slots[slot].len()
    }

    /// Files a new entry expiring `interval` seconds from now. A `looping`
    /// entry is re-filed with the same interval after it fires.
    pub fn add(&mut self, interval: u64, looping: bool, callback: TimerCallback) -> TimerKey {
        let key = self.entries.insert(TimerEntry {
            interval,
            rotation: 0,
            slot: 0,
            valid: true,
            looping,
            callback,
        });
        self.file(key);
        TimerKey(key)
    }

    /// Re-files an existing entry with a new interval, pushing its expiry
    /// out from the current slot. Returns false for a dead key.
    pub fn modify(&mut self, key: TimerKey, interval: u64) -> bool {
        let Some(entry) = self.entries.get_mut(key.0) else {
            return false;
        };
        if !entry.valid {
            return false;
        }
        let slot = entry.slot;
        entry.interval = interval;
        self.slots[slot].retain(|&filed| filed != key.0);
        self.file(key.0);
        true
    }

    /// Unfiles and drops an entry. Idempotent for dead keys.
    pub fn remove(&mut self, key: TimerKey) -> bool {
        let Some(entry) = self.entries.get_mut(key.0) else {
            return false;
        };
        entry.valid = false;
        let slot = entry.slot;
        self.slots[slot].retain(|&filed| filed != key.0);
        self.entries.remove(key.0);
        true
    }

    /// Advances one slot: fires due entries, decrements the rotation count of
    /// entries still waiting for a later revolution, drops tombstones.
    pub fn tick(&mut self) {
        let due = mem::take(&mut self.slots[self.current]);
        let mut still_waiting = Vec::new();
        let mut refile = Vec::new();

        for key in due {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            if !entry.valid {
                self.entries.remove(key);
                continue;
            }
            if entry.rotation > 0 {
                entry.rotation -= 1;
                still_waiting.push(key);
                continue;
            }

            (entry.callback)();
            if entry.looping {
                refile.push(key);
            } else {
                self.entries.remove(key);
            }
        }

        self.slots[self.current] = still_waiting;
        for key in refile {
            self.file(key);
        }
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Computes rotation and slot for a live entry and links it in.
    fn file(&mut self, key: usize) {
        let slots = self.slots.len();
        let entry = &mut self.entries[key];
        let ticks = cmp::max(1, entry.interval / self.step_secs) as usize;
        entry.rotation = ticks / slots;
        entry.slot = (self.current + ticks % slots) % slots;
        let slot = entry.slot;
        self.slots[slot].push(key);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{TimerKey, TimerWheel};

    fn add_counting(wheel: &mut TimerWheel, interval: u64, looping: bool) -> (TimerKey, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = fired.clone();
        let key = wheel.add(
            interval,
            looping,
            Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (key, handle)
    }

    // An entry with interval k is filed k slots ahead of the current one, so
    // it fires on the (k + 1)th tick.
    #[test]
    fn fires_once_its_slot_comes_around() {
        let mut wheel = TimerWheel::new(8, 1);
        let (_, fired) = add_counting(&mut wheel, 3, false);

        for _ in 0..3 {
            wheel.tick();
            assert_eq!(0, fired.load(Ordering::SeqCst));
        }
        wheel.tick();
        assert_eq!(1, fired.load(Ordering::SeqCst));
        assert!(wheel.is_empty());
    }

    #[test]
    fn sub_step_interval_rounds_up_to_one_tick() {
        let mut wheel = TimerWheel::new(8, 2);
        let (_, fired) = add_counting(&mut wheel, 1, false);

        wheel.tick();
        assert_eq!(0, fired.load(Ordering::SeqCst));
        wheel.tick();
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn long_interval_survives_full_revolutions() {
        let mut wheel = TimerWheel::new(4, 1);
        // 9 ticks on a 4-slot wheel: slot 1 with two residual revolutions.
        let (_, fired) = add_counting(&mut wheel, 9, false);

        for _ in 0..9 {
            wheel.tick();
            assert_eq!(0, fired.load(Ordering::SeqCst));
        }
        wheel.tick();
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn add_then_remove_leaves_slot_sizes_unchanged() {
        let mut wheel = TimerWheel::new(6, 1);
        let before: Vec<usize> = (0..6).map(|slot| wheel.slot_len(slot)).collect();

        let (key, fired) = add_counting(&mut wheel, 3, false);
        assert!(wheel.remove(key));

        let after: Vec<usize> = (0..6).map(|slot| wheel.slot_len(slot)).collect();
        assert_eq!(before, after);

        for _ in 0..12 {
            wheel.tick();
        }
        assert_eq!(0, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut wheel = TimerWheel::new(6, 1);
        let (key, _) = add_counting(&mut wheel, 3, false);
        assert!(wheel.remove(key));
        assert!(!wheel.remove(key));
    }

    #[test]
    fn modify_pushes_expiry_out() {
        let mut wheel = TimerWheel::new(8, 1);
        let (key, fired) = add_counting(&mut wheel, 2, false);

        wheel.tick();
        assert!(wheel.modify(key, 3));

        // The original expiry slot passes without firing; the new one is
        // three slots out from the re-file point.
        for _ in 0..3 {
            wheel.tick();
            assert_eq!(0, fired.load(Ordering::SeqCst));
        }
        wheel.tick();
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn looping_entry_is_refiled_after_firing() {
        let mut wheel = TimerWheel::new(4, 1);
        let (_, fired) = add_counting(&mut wheel, 2, true);

        // Fires on ticks 3, 5, and 7: re-filed two slots out each time.
        for _ in 0..8 {
            wheel.tick();
        }
        assert_eq!(3, fired.load(Ordering::SeqCst));
        assert_eq!(1, wheel.len());
    }

    #[test]
    fn tick_advances_exactly_one_slot() {
        let mut wheel = TimerWheel::new(60, 1);
        assert_eq!(0, wheel.current_slot());
        wheel.tick();
        assert_eq!(1, wheel.current_slot());
        wheel.tick();
        assert_eq!(2, wheel.current_slot());
    }
}
