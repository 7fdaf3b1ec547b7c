/*
 * Created on Fri Mar 15 2024
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

//! A Robin Hood linear-probing hash table over fixed-size opaque keys and
//! values.
//!
//! Keys and values are raw byte strings whose sizes are fixed at
//! construction; equality is byte equality. The table is two stores:
//!
//! - the *bucket array*: per bucket a header (probe-sequence length + a
//!   [`ValueRef`]) and the key bytes inline. Probing displaces residents
//!   with a shorter probe length ("rob the rich"), which bounds the
//!   variance of probe lengths and lets lookups stop early.
//! - the *value pool*: pinned chunks of value slots. Every bucket —
//!   occupied or empty — permanently owns one distinct slot, and every
//!   displacement or back-shift swaps only the refs. Value bytes therefore
//!   never move: a [`ValueRef`] obtained from [`FlowTable::insert`] stays
//!   valid until its entry is removed and the slot recycled, *including*
//!   across growth (growth re-hashes buckets and adds a pool chunk, it
//!   never touches existing slots).
//!
//! Deletion is back-shift instead of tombstones: followers with a nonzero
//! probe length move back one bucket each until an empty bucket or one
//! already at its ideal position terminates the walk.

mod iter;
#[cfg(test)]
mod tests;

pub use iter::Entries;

use {
    crate::{
        error::{FlowError, FlowResult},
        hash::{hash_bytes, map_range_u32},
        memory::{slot_array_layout, word_align_up, Allocator, Global},
    },
    core::{mem, ptr, ptr::NonNull, slice},
    std::alloc::Layout,
};

/// A stable handle to one value slot in the pool. Valid until the owning
/// entry is removed and the slot recycled by a later insert; growth never
/// invalidates it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ValueRef {
    pub(crate) chunk: u32,
    pub(crate) index: u32,
}

// placeholder during rebuilds; never observable through the public API
const NULL_REF: ValueRef = ValueRef {
    chunk: u32::MAX,
    index: u32::MAX,
};

#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    pub key_size: usize,
    pub value_size: usize,
    /// element capacity (doubles on demand when `resizable`)
    pub max_elems: u32,
    /// occupancy bound in (0, 1) that storage is sized for
    pub max_load_factor: f64,
    pub resizable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableStatus {
    pub max_elems: u32,
    pub elems_in_use: u32,
    pub size_in_bytes: usize,
    pub current_load_factor: f64,
}

/// Bucket header. `psl` is the distance from the bucket the key hashes to;
/// [`EMPTY`] marks a free bucket
#[repr(C)]
#[derive(Clone, Copy)]
struct BucketHeader {
    psl: u32,
    value: ValueRef,
}

const EMPTY: u32 = u32::MAX;
const BUCKET_HDR: usize = mem::size_of::<BucketHeader>();

#[derive(Debug)]
struct ValueChunk {
    base: NonNull<u8>,
    slots: u32,
}

#[derive(Debug)]
pub struct FlowTable<A: Allocator = Global> {
    buckets: NonNull<u8>,
    max_indices: u32,
    bucket_stride: usize,
    key_size: usize,
    value_size: usize,
    value_stride: usize,
    chunks: Vec<ValueChunk>,
    // displacement carry buffer, key_size bytes
    scratch: NonNull<u8>,
    elems: u32,
    max_elems: u32,
    max_load_factor: f64,
    resizable: bool,
    alloc: A,
}

/// A raw, unowned view of a bucket array. Lets the probing primitives run
/// against either the live array or the half-built one during growth
#[derive(Clone, Copy)]
struct RawBuckets {
    base: NonNull<u8>,
    n: u32,
    stride: usize,
    key_size: usize,
}

impl RawBuckets {
    #[inline(always)]
    fn bucket_ptr(&self, i: u32) -> *mut u8 {
        debug_assert!(i < self.n);
        unsafe {
            // UNSAFE(@ohsayan): in range per the debug assert
            self.base.as_ptr().add(self.stride * i as usize)
        }
    }
    #[inline(always)]
    fn header(&self, i: u32) -> BucketHeader {
        unsafe {
            // UNSAFE(@ohsayan): headers live at every bucket start
            ptr::read(self.bucket_ptr(i) as *const BucketHeader)
        }
    }
    #[inline(always)]
    fn set_header(&self, i: u32, h: BucketHeader) {
        unsafe {
            // UNSAFE(@ohsayan): headers live at every bucket start
            ptr::write(self.bucket_ptr(i) as *mut BucketHeader, h);
        }
    }
    #[inline(always)]
    fn key_ptr(&self, i: u32) -> *mut u8 {
        unsafe {
            // UNSAFE(@ohsayan): key bytes follow the header
            self.bucket_ptr(i).add(BUCKET_HDR)
        }
    }
    #[inline(always)]
    fn key(&self, i: u32) -> &[u8] {
        unsafe {
            // UNSAFE(@ohsayan): key bytes of an occupied bucket are initialized
            slice::from_raw_parts(self.key_ptr(i), self.key_size)
        }
    }
    #[inline(always)]
    fn next(&self, i: u32) -> u32 {
        // wrap-around probing
        let n = i + 1;
        if n == self.n {
            0
        } else {
            n
        }
    }
    #[inline(always)]
    fn start(&self, key: &[u8]) -> u32 {
        map_range_u32(hash_bytes(key) as u32, self.n)
    }

    /// Walk a displacement chain. `scratch` carries the displaced key,
    /// `psl`/`vref` its probe length and slot. Returns the spare slot of the
    /// empty bucket that terminates the chain
    fn emplace_displaced(&self, mut psl: u32, mut at: u32, mut vref: ValueRef, scratch: *mut u8) -> ValueRef {
        loop {
            psl += 1;
            at = self.next(at);
            let mut h = self.header(at);
            if h.psl == EMPTY {
                unsafe {
                    // UNSAFE(@ohsayan): scratch holds key_size carried bytes
                    ptr::copy_nonoverlapping(scratch, self.key_ptr(at), self.key_size);
                }
                let spare = h.value;
                h.psl = psl;
                h.value = vref;
                self.set_header(at, h);
                return spare;
            }
            if psl > h.psl {
                unsafe {
                    // UNSAFE(@ohsayan): scratch never aliases the bucket array
                    ptr::swap_nonoverlapping(scratch, self.key_ptr(at), self.key_size);
                }
                mem::swap(&mut psl, &mut h.psl);
                mem::swap(&mut vref, &mut h.value);
                self.set_header(at, h);
            }
        }
    }

    /// Robin Hood insert of a key known to be absent (the growth path).
    /// Unlike the live path, the entry brings its own slot
    fn rehash_emplace(&self, key: &[u8], vref: ValueRef, scratch: *mut u8) {
        let mut at = self.start(key);
        let mut psl = 0u32;
        loop {
            let mut h = self.header(at);
            if h.psl == EMPTY {
                unsafe {
                    // UNSAFE(@ohsayan): bucket owns key_size bytes past the header
                    ptr::copy_nonoverlapping(key.as_ptr(), self.key_ptr(at), self.key_size);
                }
                h.psl = psl;
                h.value = vref;
                self.set_header(at, h);
                return;
            }
            if psl > h.psl {
                unsafe {
                    // UNSAFE(@ohsayan): displaced key parks in scratch
                    ptr::copy_nonoverlapping(self.key_ptr(at), scratch, self.key_size);
                    ptr::copy_nonoverlapping(key.as_ptr(), self.key_ptr(at), self.key_size);
                }
                let (dpsl, dref) = (h.psl, h.value);
                h.psl = psl;
                h.value = vref;
                self.set_header(at, h);
                // the chain ends on an empty bucket whose placeholder slot
                // is dropped; real spares are reassigned after the rebuild
                let _ = self.emplace_displaced(dpsl, at, dref, scratch);
                return;
            }
            psl += 1;
            at = self.next(at);
        }
    }
}

impl FlowTable<Global> {
    pub fn new(config: TableConfig) -> FlowResult<Self> {
        Self::with_allocator(config, Global)
    }
}

impl<A: Allocator> FlowTable<A> {
    /// Buckets needed for `max_elems` at load factor `load`: at least one
    /// bucket always stays empty so every probe terminates
    fn storage_for(max_elems: u32, load: f64) -> FlowResult<u32> {
        if max_elems == 0 {
            return Err(FlowError::ZeroCapacity);
        }
        if !(load > 0.0 && load < 1.0) {
            return Err(FlowError::BadLoadFactor);
        }
        let needed = (max_elems as f64 / load).ceil() as u64 + 1;
        u32::try_from(needed).map_err(|_| FlowError::CapacityExceeded)
    }

    pub fn with_allocator(config: TableConfig, alloc: A) -> FlowResult<Self> {
        if config.key_size == 0 {
            return Err(FlowError::ZeroKeySize);
        }
        if config.value_size == 0 {
            return Err(FlowError::ZeroValueSize);
        }
        let max_indices = Self::storage_for(config.max_elems, config.max_load_factor)?;
        let bucket_stride = word_align_up(BUCKET_HDR + config.key_size);
        let value_stride = word_align_up(config.value_size);

        let bucket_layout = slot_array_layout(bucket_stride, max_indices as usize)?;
        let buckets = alloc.allocate(bucket_layout)?;
        let chunk_layout = slot_array_layout(value_stride, max_indices as usize)?;
        let chunk_base = match alloc.allocate(chunk_layout) {
            Ok(base) => base,
            Err(e) => {
                unsafe {
                    // UNSAFE(@ohsayan): allocated right above with this layout
                    alloc.deallocate(buckets, bucket_layout);
                }
                return Err(e);
            }
        };
        let scratch_layout = Layout::from_size_align(config.key_size, 1)
            .map_err(|_| FlowError::AllocFailed)?;
        let scratch = match alloc.allocate(scratch_layout) {
            Ok(block) => block,
            Err(e) => {
                unsafe {
                    // UNSAFE(@ohsayan): both blocks were allocated above
                    alloc.deallocate(buckets, bucket_layout);
                    alloc.deallocate(chunk_base, chunk_layout);
                }
                return Err(e);
            }
        };

        let table = Self {
            buckets,
            max_indices,
            bucket_stride,
            key_size: config.key_size,
            value_size: config.value_size,
            value_stride,
            chunks: vec![ValueChunk {
                base: chunk_base,
                slots: max_indices,
            }],
            scratch,
            elems: 0,
            max_elems: config.max_elems,
            max_load_factor: config.max_load_factor,
            resizable: config.resizable,
            alloc,
        };
        // every bucket starts empty and owns its pool slot 1:1
        let view = table.view();
        for i in 0..max_indices {
            view.set_header(
                i,
                BucketHeader {
                    psl: EMPTY,
                    value: ValueRef { chunk: 0, index: i },
                },
            );
        }
        Ok(table)
    }

    #[inline(always)]
    fn view(&self) -> RawBuckets {
        RawBuckets {
            base: self.buckets,
            n: self.max_indices,
            stride: self.bucket_stride,
            key_size: self.key_size,
        }
    }

    pub fn len(&self) -> usize {
        self.elems as usize
    }
    pub fn is_empty(&self) -> bool {
        self.elems == 0
    }
    pub fn key_size(&self) -> usize {
        self.key_size
    }
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /*
        value pool
    */

    #[inline(always)]
    pub(crate) fn value_ptr(&self, r: ValueRef) -> *mut u8 {
        let chunk = &self.chunks[r.chunk as usize];
        assert!(r.index < chunk.slots, "value handle out of range");
        unsafe {
            // UNSAFE(@ohsayan): in range per the assert
            chunk.base.as_ptr().add(self.value_stride * r.index as usize)
        }
    }
    /// The value bytes behind a handle
    pub fn value(&self, r: ValueRef) -> &[u8] {
        unsafe {
            // UNSAFE(@ohsayan): value_ptr bounds the handle
            slice::from_raw_parts(self.value_ptr(r), self.value_size)
        }
    }
    pub fn value_mut(&mut self, r: ValueRef) -> &mut [u8] {
        unsafe {
            // UNSAFE(@ohsayan): see value; &mut self excludes readers
            slice::from_raw_parts_mut(self.value_ptr(r), self.value_size)
        }
    }

    /*
        ops
    */

    /// Find a key. Walks from the ideal bucket and gives up as soon as it
    /// meets an empty bucket or one with a shorter probe length than the
    /// distance walked: the Robin Hood invariant puts our key before either
    pub fn lookup(&self, key: &[u8]) -> Option<ValueRef> {
        self.lookup_index(key).map(|i| self.view().header(i).value)
    }

    fn lookup_index(&self, key: &[u8]) -> Option<u32> {
        assert_eq!(key.len(), self.key_size, "key length != configured key size");
        let view = self.view();
        let mut at = view.start(key);
        let mut walked = 0u32;
        loop {
            let h = view.header(at);
            if h.psl == EMPTY || h.psl < walked {
                return None;
            }
            if view.key(at) == key {
                return Some(at);
            }
            walked += 1;
            at = view.next(at);
        }
    }

    /// Insert a key, returning the handle to its value slot. Idempotent: an
    /// existing key returns its current slot untouched
    pub fn insert(&mut self, key: &[u8]) -> FlowResult<ValueRef> {
        self.insert_full(key).map(|(r, _)| r)
    }

    /// Like [`FlowTable::insert`] but also reports whether the entry is fresh
    pub(crate) fn insert_full(&mut self, key: &[u8]) -> FlowResult<(ValueRef, bool)> {
        assert_eq!(key.len(), self.key_size, "key length != configured key size");
        if self.elems >= self.max_elems {
            if let Some(r) = self.lookup(key) {
                return Ok((r, false));
            }
            self.resize_to(self.max_elems as u64 * 2)?;
        }
        let view = self.view();
        let mut at = view.start(key);
        let mut psl = 0u32;
        loop {
            let mut h = view.header(at);
            if h.psl == EMPTY {
                // plain insert: the bucket's own spare slot becomes ours
                unsafe {
                    // UNSAFE(@ohsayan): bucket owns key_size bytes past the header
                    ptr::copy_nonoverlapping(key.as_ptr(), view.key_ptr(at), self.key_size);
                }
                h.psl = psl;
                let vref = h.value;
                view.set_header(at, h);
                self.elems += 1;
                return Ok((vref, true));
            }
            if view.key(at) == key {
                return Ok((h.value, false));
            }
            if psl > h.psl {
                // rob the rich: take this bucket, push the resident down the
                // chain. The chain's terminal spare slot becomes this entry's
                unsafe {
                    // UNSAFE(@ohsayan): scratch is key_size bytes, disjoint
                    // from the bucket array
                    ptr::copy_nonoverlapping(view.key_ptr(at), self.scratch.as_ptr(), self.key_size);
                    ptr::copy_nonoverlapping(key.as_ptr(), view.key_ptr(at), self.key_size);
                }
                let (dpsl, dref) = (h.psl, h.value);
                h.psl = psl;
                h.value = view.emplace_displaced(dpsl, at, dref, self.scratch.as_ptr());
                view.set_header(at, h);
                self.elems += 1;
                return Ok((h.value, true));
            }
            psl += 1;
            at = view.next(at);
        }
    }

    /// Remove a key. The returned handle denotes the vacated slot: its bytes
    /// stay readable until a later insert recycles it
    pub fn remove(&mut self, key: &[u8]) -> Option<ValueRef> {
        let at = self.lookup_index(key)?;
        let view = self.view();
        let mut h = view.header(at);
        let vacated = h.value;
        h.psl = EMPTY;
        view.set_header(at, h);
        // back-shift: pull followers one bucket towards their ideal spot.
        // A follower with psl == 0 is already ideal and must not move
        let mut cur = at;
        loop {
            let nxt = view.next(cur);
            let hn = view.header(nxt);
            if hn.psl == EMPTY || hn.psl == 0 {
                break;
            }
            unsafe {
                // UNSAFE(@ohsayan): adjacent buckets never overlap
                ptr::copy_nonoverlapping(view.key_ptr(nxt), view.key_ptr(cur), self.key_size);
            }
            // swap the refs so every bucket keeps owning exactly one slot
            // (the vacated slot rides the chain to the final empty bucket)
            let hc = view.header(cur);
            view.set_header(
                cur,
                BucketHeader {
                    psl: hn.psl - 1,
                    value: hn.value,
                },
            );
            view.set_header(
                nxt,
                BucketHeader {
                    psl: EMPTY,
                    value: hc.value,
                },
            );
            cur = nxt;
        }
        self.elems -= 1;
        Some(vacated)
    }

    /// Drop every entry, keeping capacity and pool pairing
    pub fn clear(&mut self) {
        let view = self.view();
        for i in 0..self.max_indices {
            let mut h = view.header(i);
            h.psl = EMPTY;
            view.set_header(i, h);
        }
        self.elems = 0;
    }

    /// Grow capacity to hold at least `n` elements, even if the table was
    /// created fixed-size
    pub fn reserve(&mut self, n: u32) -> FlowResult<()> {
        let saved = self.resizable;
        self.resizable = true;
        let outcome = self.resize_to(n as u64);
        self.resizable = saved;
        outcome
    }

    pub fn status(&self) -> TableStatus {
        let bucket_bytes = self.bucket_stride * self.max_indices as usize;
        let value_bytes: usize = self
            .chunks
            .iter()
            .map(|c| self.value_stride * c.slots as usize)
            .sum();
        TableStatus {
            max_elems: self.max_elems,
            elems_in_use: self.elems,
            size_in_bytes: bucket_bytes + value_bytes + mem::size_of::<Self>(),
            current_load_factor: self.elems as f64 / self.max_indices as f64,
        }
    }

    /// Iterate over `(key bytes, value handle)` in bucket order
    pub fn iter(&self) -> Entries<'_, A> {
        Entries::new(self)
    }

    /*
        growth
    */

    /// Rebuild the bucket array for `new_max` elements. Occupied buckets are
    /// re-hashed carrying their slots; the slots parked on old empty buckets
    /// plus one fresh pool chunk cover the new array's empty buckets. Value
    /// bytes never move. Allocation failure leaves the table untouched
    fn resize_to(&mut self, new_max: u64) -> FlowResult<()> {
        if !self.resizable {
            return Err(FlowError::CapacityExceeded);
        }
        if new_max <= self.max_elems as u64 {
            return Ok(());
        }
        let new_max = u32::try_from(new_max).map_err(|_| FlowError::CapacityExceeded)?;
        let new_indices = Self::storage_for(new_max, self.max_load_factor)?;
        let added_slots = new_indices - self.max_indices;

        let old_bucket_layout = slot_array_layout(self.bucket_stride, self.max_indices as usize)?;
        let bucket_layout = slot_array_layout(self.bucket_stride, new_indices as usize)?;
        let new_buckets = self.alloc.allocate(bucket_layout)?;
        let chunk_layout = slot_array_layout(self.value_stride, added_slots as usize)?;
        let chunk_base = match self.alloc.allocate(chunk_layout) {
            Ok(base) => base,
            Err(e) => {
                unsafe {
                    // UNSAFE(@ohsayan): allocated right above with this layout
                    self.alloc.deallocate(new_buckets, bucket_layout);
                }
                return Err(e);
            }
        };

        let new_view = RawBuckets {
            base: new_buckets,
            n: new_indices,
            stride: self.bucket_stride,
            key_size: self.key_size,
        };
        for i in 0..new_indices {
            new_view.set_header(
                i,
                BucketHeader {
                    psl: EMPTY,
                    value: NULL_REF,
                },
            );
        }

        // move the entries, park the spares
        let old_view = self.view();
        let mut spares = Vec::new();
        for i in 0..self.max_indices {
            let h = old_view.header(i);
            if h.psl == EMPTY {
                spares.push(h.value);
            } else {
                new_view.rehash_emplace(old_view.key(i), h.value, self.scratch.as_ptr());
            }
        }
        // old spares first, then the fresh chunk, cover every empty bucket
        let new_chunk_id = self.chunks.len() as u32;
        let mut fresh = 0u32;
        for i in 0..new_indices {
            let mut h = new_view.header(i);
            if h.psl != EMPTY {
                continue;
            }
            h.value = match spares.pop() {
                Some(spare) => spare,
                None => {
                    let spare = ValueRef {
                        chunk: new_chunk_id,
                        index: fresh,
                    };
                    fresh += 1;
                    spare
                }
            };
            new_view.set_header(i, h);
        }
        debug_assert_eq!(fresh, added_slots);
        debug_assert!(spares.is_empty());

        unsafe {
            // UNSAFE(@ohsayan): the old array was allocated with this layout
            self.alloc.deallocate(self.buckets, old_bucket_layout);
        }
        self.buckets = new_buckets;
        self.max_indices = new_indices;
        self.max_elems = new_max;
        self.chunks.push(ValueChunk {
            base: chunk_base,
            slots: added_slots,
        });
        Ok(())
    }

    /*
        test plumbing
    */

    /// Walk every occupied bucket and check the Robin Hood ordering: each
    /// entry sits exactly `psl` buckets past its ideal index, and nothing
    /// between the two is empty or closer to home than it should be
    #[cfg(test)]
    pub(crate) fn check_probe_invariant(&self) {
        let view = self.view();
        let mut occupied = 0u32;
        for i in 0..self.max_indices {
            let h = view.header(i);
            if h.psl == EMPTY {
                continue;
            }
            occupied += 1;
            let ideal = view.start(view.key(i));
            let dist = ((i as u64 + self.max_indices as u64 - ideal as u64)
                % self.max_indices as u64) as u32;
            assert_eq!(h.psl, dist, "psl does not match walked distance");
            let mut j = ideal;
            let mut walked = 0u32;
            while j != i {
                let hj = view.header(j);
                assert_ne!(hj.psl, EMPTY, "hole inside a probe chain");
                assert!(hj.psl >= walked, "probe chain out of robin hood order");
                walked += 1;
                j = view.next(j);
            }
        }
        assert_eq!(occupied, self.elems);
    }

    // iterator plumbing
    #[inline(always)]
    pub(super) fn indices(&self) -> u32 {
        self.max_indices
    }
    #[inline(always)]
    pub(super) fn bucket_entry(&self, i: u32) -> Option<(&[u8], ValueRef)> {
        let view = self.view();
        let h = view.header(i);
        if h.psl == EMPTY {
            return None;
        }
        unsafe {
            // UNSAFE(@ohsayan): occupied bucket; the slice borrows self
            Some((
                slice::from_raw_parts(view.key_ptr(i), self.key_size),
                h.value,
            ))
        }
    }
}

impl<A: Allocator> Drop for FlowTable<A> {
    fn drop(&mut self) {
        unsafe {
            // UNSAFE(@ohsayan): layouts recompute to exactly what was allocated
            self.alloc.deallocate(
                self.buckets,
                Layout::from_size_align_unchecked(
                    self.bucket_stride * self.max_indices as usize,
                    mem::align_of::<usize>(),
                ),
            );
            for chunk in &self.chunks {
                self.alloc.deallocate(
                    chunk.base,
                    Layout::from_size_align_unchecked(
                        self.value_stride * chunk.slots as usize,
                        mem::align_of::<usize>(),
                    ),
                );
            }
            self.alloc.deallocate(
                self.scratch,
                Layout::from_size_align_unchecked(self.key_size, 1),
            );
        }
    }
}

unsafe impl<A: Allocator + Send> Send for FlowTable<A> {}
unsafe impl<A: Allocator + Sync> Sync for FlowTable<A> {}
