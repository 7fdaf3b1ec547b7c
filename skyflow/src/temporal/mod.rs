/*
 * Created on Sat Mar 23 2024
 *
 * This file is a part of Skyflow
 * Skyflow is a free and open-source embeddable session table library
 * written by Sayan Nandan ("the Author") with the vision to provide
 * fast in-memory flow tracking with predictable timeout eviction
 *
 * Copyright (c) 2024, Sayan Nandan <nandansayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The session table: a [`FlowTable`] coupled with up to 127 timeout slots,
//! each a [`TimerHeap`] with its own timeout delta, driven by one monotonic
//! clock.
//!
//! The coupling protocol: every hash value bucket carries a hidden prefix
//! `{packed timer handle, slot id}` ahead of the user bytes. An entry in
//! slot `s > 0` has exactly one heap entry in `slots[s - 1]` whose key is
//! the entry's timestamp and whose payload is a copy of the hash key — the
//! payload is what lets an expiry sweep find its way back to the hash
//! entry. Both directions survive arbitrary reorganization because both
//! containers hand out pinned-slot handles.

#[cfg(test)]
mod tests;

use {
    crate::{
        error::{FlowError, FlowResult},
        heap::{self, HeapConfig, TimerHeap, TimerRef},
        memory::{Allocator, Global},
        table::{FlowTable, TableConfig, TableStatus, ValueRef},
    },
    core::{mem, ptr, slice},
};

/// Slot ids are a u8 with 0 = "no expiry", so at most 127 real slots
pub const MAX_TIMEOUT_SLOTS: usize = 127;

/// Hidden per-entry prefix inside the hash value bucket
#[repr(C)]
#[derive(Clone, Copy)]
struct EntryMeta {
    /// packed [`TimerRef`], or [`NO_TIMER`]
    timer: u64,
    /// 0 = untimed
    slot: u8,
}

const NO_TIMER: u64 = u64::MAX;
const META_SIZE: usize = mem::size_of::<EntryMeta>();

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub table: TableConfig,
}

/// An expired entry reported by [`SessionTable::next_timeout_entries`].
/// Both slices point into container storage that nothing moves while the
/// sweep borrow is alive
#[derive(Debug, Clone, Copy)]
pub struct ExpiredPair<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

struct TimeoutSlot<A: Allocator> {
    heap: TimerHeap<A>,
    timeout: i64,
}

pub struct SessionTable<A: Allocator + Clone = Global> {
    table: FlowTable<A>,
    slots: Vec<TimeoutSlot<A>>,
    last_timestamp: i64,
    user_value_size: usize,
    alloc: A,
}

impl SessionTable<Global> {
    pub fn new(config: SessionConfig) -> FlowResult<Self> {
        Self::with_allocator(config, Global)
    }
}

impl<A: Allocator + Clone> SessionTable<A> {
    pub fn with_allocator(config: SessionConfig, alloc: A) -> FlowResult<Self> {
        if config.table.value_size == 0 {
            return Err(FlowError::ZeroValueSize);
        }
        let mut table_config = config.table;
        let user_value_size = table_config.value_size;
        // room for the coupling prefix ahead of the user bytes
        table_config.value_size = META_SIZE + user_value_size;
        let table = FlowTable::with_allocator(table_config, alloc.clone())?;
        Ok(Self {
            table,
            slots: Vec::new(),
            last_timestamp: 0,
            user_value_size,
            alloc,
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
    pub fn key_size(&self) -> usize {
        self.table.key_size()
    }
    pub fn value_size(&self) -> usize {
        self.user_value_size
    }
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }
    pub fn table_status(&self) -> TableStatus {
        self.table.status()
    }

    /*
        meta plumbing. Unaligned accesses because the prefix sits at a
        word-aligned (not necessarily 8-aligned) offset on 32-bit targets
    */

    fn read_meta(&self, vref: ValueRef) -> EntryMeta {
        unsafe {
            // UNSAFE(@ohsayan): every value bucket starts with a prefix
            ptr::read_unaligned(self.table.value_ptr(vref) as *const EntryMeta)
        }
    }
    fn write_meta(&mut self, vref: ValueRef, meta: EntryMeta) {
        unsafe {
            // UNSAFE(@ohsayan): every value bucket starts with a prefix
            ptr::write_unaligned(self.table.value_ptr(vref) as *mut EntryMeta, meta);
        }
    }

    /// The user bytes behind a handle
    pub fn value(&self, vref: ValueRef) -> &[u8] {
        &self.table.value(vref)[META_SIZE..]
    }
    pub fn value_mut(&mut self, vref: ValueRef) -> &mut [u8] {
        &mut self.table.value_mut(vref)[META_SIZE..]
    }

    /*
        slots and the clock
    */

    /// Append a timeout slot holding `num_elements` timers that expire
    /// `timeout` clock units after their timestamp. Returns the 1-based id
    pub fn add_timeout_slot(
        &mut self,
        timeout: i64,
        num_elements: u32,
        resizable: bool,
    ) -> FlowResult<u8> {
        if self.slots.len() >= MAX_TIMEOUT_SLOTS {
            return Err(FlowError::TooManySlots);
        }
        let heap = TimerHeap::with_allocator(
            HeapConfig {
                // the payload carries the original hash key
                value_size: self.table.key_size(),
                max_elems: num_elements,
                resizable,
            },
            self.alloc.clone(),
        )?;
        self.slots.push(TimeoutSlot { heap, timeout });
        Ok(self.slots.len() as u8)
    }

    /// Advance the global clock. The clock is monotonic: a smaller
    /// timestamp is rejected and nothing changes
    pub fn increase_global_time(&mut self, timestamp: i64) -> FlowResult<()> {
        if timestamp < self.last_timestamp {
            return Err(FlowError::ClockRegression);
        }
        self.last_timestamp = timestamp;
        Ok(())
    }

    /*
        ops
    */

    /// Insert a key. `slot_id` 0 means no expiry; otherwise the entry is
    /// stamped with the current clock and tracked in `slots[slot_id - 1]`.
    /// An existing key is returned untouched (no second timer is booked).
    /// If the slot's heap refuses the timer, the fresh hash entry is rolled
    /// back and nothing changed
    pub fn insert(&mut self, key: &[u8], slot_id: u8) -> FlowResult<ValueRef> {
        if slot_id as usize > self.slots.len() {
            return Err(FlowError::UnknownSlot);
        }
        let (vref, fresh) = self.table.insert_full(key)?;
        if !fresh {
            return Ok(vref);
        }
        if slot_id == 0 {
            self.write_meta(
                vref,
                EntryMeta {
                    timer: NO_TIMER,
                    slot: 0,
                },
            );
            return Ok(vref);
        }
        let slot = &mut self.slots[slot_id as usize - 1];
        match slot.heap.insert(self.last_timestamp) {
            Ok(node) => {
                slot.heap.payload_mut(node).copy_from_slice(key);
                self.write_meta(
                    vref,
                    EntryMeta {
                        timer: node.pack(),
                        slot: slot_id,
                    },
                );
                Ok(vref)
            }
            Err(e) => {
                let rolled_back = self.table.remove(key);
                debug_assert!(rolled_back.is_some());
                Err(e)
            }
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<ValueRef> {
        self.table.lookup(key)
    }

    /// Remove a key along with its timer, if it had one
    pub fn remove(&mut self, key: &[u8]) -> Option<ValueRef> {
        let vref = self.table.remove(key)?;
        let meta = self.read_meta(vref);
        if meta.slot > 0 {
            let slot = &mut self.slots[meta.slot as usize - 1];
            let removed = slot.heap.remove(TimerRef::unpack(meta.timer));
            debug_assert!(removed.is_some(), "entry had a slot but no timer");
        }
        Some(vref)
    }

    /// Move an entry to another timeout slot. Moving between two real slots
    /// keeps the entry's timestamp; picking up an untimed entry stamps it
    /// with the current clock. The same slot is a no-op. If the target heap
    /// refuses the timer the entry is restored to its previous binding and
    /// `None` is returned
    pub fn set_timeout_slot(&mut self, key: &[u8], new_slot: u8) -> Option<ValueRef> {
        if new_slot == 0 || new_slot as usize > self.slots.len() {
            return None;
        }
        let vref = self.table.lookup(key)?;
        let meta = self.read_meta(vref);
        if meta.slot == new_slot {
            return Some(vref);
        }
        let timestamp = if meta.slot > 0 {
            let old = &mut self.slots[meta.slot as usize - 1];
            match old.heap.remove(TimerRef::unpack(meta.timer)) {
                Some((timestamp, node)) => {
                    debug_assert_eq!(old.heap.payload(node), key);
                    timestamp
                }
                None => {
                    debug_assert!(false, "entry had a slot but no timer");
                    return None;
                }
            }
        } else {
            self.last_timestamp
        };
        let target = &mut self.slots[new_slot as usize - 1];
        match target.heap.insert(timestamp) {
            Ok(node) => {
                target.heap.payload_mut(node).copy_from_slice(key);
                self.write_meta(
                    vref,
                    EntryMeta {
                        timer: node.pack(),
                        slot: new_slot,
                    },
                );
                Some(vref)
            }
            Err(_) => {
                if meta.slot > 0 {
                    // the old slot just freed a node, so this cannot refuse
                    let old = &mut self.slots[meta.slot as usize - 1];
                    match old.heap.insert(timestamp) {
                        Ok(node) => {
                            old.heap.payload_mut(node).copy_from_slice(key);
                            self.write_meta(
                                vref,
                                EntryMeta {
                                    timer: node.pack(),
                                    slot: meta.slot,
                                },
                            );
                        }
                        Err(_) => {
                            debug_assert!(false, "reinsert after remove refused");
                            self.write_meta(
                                vref,
                                EntryMeta {
                                    timer: NO_TIMER,
                                    slot: 0,
                                },
                            );
                        }
                    }
                }
                None
            }
        }
    }

    /// Re-stamp an entry's timer in place. Rejects timestamps behind the
    /// clock, untimed entries and absent keys
    pub fn update_time_for_entry(&mut self, key: &[u8], new_timestamp: i64) -> Option<ValueRef> {
        if new_timestamp < self.last_timestamp {
            return None;
        }
        let vref = self.table.lookup(key)?;
        let meta = self.read_meta(vref);
        if meta.slot == 0 {
            return None;
        }
        debug_assert!(meta.slot as usize <= self.slots.len());
        let slot = &mut self.slots[meta.slot as usize - 1];
        let updated = slot
            .heap
            .change_key(TimerRef::unpack(meta.timer), new_timestamp);
        if updated != new_timestamp {
            return None;
        }
        Some(vref)
    }

    /// Sweep expired entries, at most `limit` of them, in slot-id order:
    /// within a slot, entries whose `timestamp + timeout` is not past the
    /// clock end that slot's drain. Every reported entry has been removed
    /// from the table. The pairs borrow pinned storage: the key bytes live
    /// in the slot's payload pool, the value bytes in the table's — neither
    /// is moved by the sweep itself, and the `&mut` borrow keeps them
    /// untouched for as long as the caller holds the result
    pub fn next_timeout_entries(&mut self, limit: usize) -> Vec<ExpiredPair<'_>> {
        let mut out = Vec::new();
        let key_size = self.table.key_size();
        for slot_idx in 0..self.slots.len() {
            loop {
                if out.len() == limit {
                    return out;
                }
                let (min_timestamp, timeout) = {
                    let slot = &self.slots[slot_idx];
                    (slot.heap.find_min(), slot.timeout)
                };
                if min_timestamp == heap::NOT_FOUND {
                    break;
                }
                if self.last_timestamp < min_timestamp.saturating_add(timeout) {
                    break;
                }
                let Some(node) = self.slots[slot_idx].heap.delete_min() else {
                    break;
                };
                let key = unsafe {
                    // UNSAFE(@ohsayan): freed payload nodes stay pinned and
                    // are only recycled by an insert, which the exclusive
                    // borrow rules out
                    slice::from_raw_parts(self.slots[slot_idx].heap.payload_ptr(node), key_size)
                };
                let Some(vref) = self.table.remove(key) else {
                    debug_assert!(false, "expired timer without a hash entry");
                    break;
                };
                let value = unsafe {
                    // UNSAFE(@ohsayan): vacated value slots are likewise only
                    // recycled by an insert
                    slice::from_raw_parts(
                        self.table.value_ptr(vref).add(META_SIZE) as *const u8,
                        self.user_value_size,
                    )
                };
                out.push(ExpiredPair { key, value });
            }
        }
        out
    }

    /*
        test plumbing
    */

    /// Entries tracked across all slot heaps
    #[cfg(test)]
    pub(crate) fn timed_count(&self) -> usize {
        self.slots.iter().map(|s| s.heap.len()).sum()
    }
    /// Check the coupling: every timed hash entry has exactly one timer
    /// whose payload is its key, and the heap populations add up
    #[cfg(test)]
    pub(crate) fn check_coupling(&self) {
        let mut timed = 0usize;
        for (key, vref) in self.table.iter() {
            let meta = self.read_meta(vref);
            if meta.slot == 0 {
                continue;
            }
            timed += 1;
            let slot = &self.slots[meta.slot as usize - 1];
            assert_eq!(slot.heap.payload(TimerRef::unpack(meta.timer)), key);
        }
        assert_eq!(timed, self.timed_count());
    }
}
