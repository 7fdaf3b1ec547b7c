/*
 * Created on Sun Mar 10 2024
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

//! An indirect binary min-heap over `i64` keys with *pinned* payloads.
//!
//! The heap is split into two parallel stores: an array of key records
//! (`{key, node}`) that is permuted to maintain heap order, and a pool of
//! payload nodes (`{backlink, bytes}`) that never move once allocated.
//! Every reorganization swaps key records and patches the two backlinks,
//! so a [`TimerRef`] handed out by [`TimerHeap::insert`] stays valid for
//! the life of the heap: across sifts, deletions of *other* entries and
//! growth. That stability is what allows another container to store the
//! handle inside its own records (see the `temporal` module).


use {
    crate::{
        error::{FlowError, FlowResult},
        memory::{slot_array_layout, word_align_up, Allocator, Global},
    },
    core::{mem, ptr, ptr::NonNull, slice},
    std::alloc::Layout,
};

/// Returned by [`TimerHeap::find_min`] on an empty heap; never a legal key
pub const NOT_FOUND: i64 = i64::MIN;
/// The smallest key a caller may store
pub const MIN_KEY: i64 = i64::MIN + 1;

/// A stable handle to one payload node. Valid from the `insert` that
/// returned it until the entry is deleted; a deleted handle is recycled by
/// a later insert and must not be reused by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRef {
    chunk: u32,
    index: u32,
}

impl TimerRef {
    #[inline(always)]
    pub(crate) const fn pack(self) -> u64 {
        ((self.chunk as u64) << 32) | self.index as u64
    }
    #[inline(always)]
    pub(crate) const fn unpack(raw: u64) -> Self {
        Self {
            chunk: (raw >> 32) as u32,
            index: raw as u32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// payload bytes per entry
    pub value_size: usize,
    /// entry capacity (doubles on demand when `resizable`)
    pub max_elems: u32,
    pub resizable: bool,
}

/// One key record. Index into the record array is the heap position
#[repr(C)]
#[derive(Clone, Copy)]
struct KeyRecord {
    key: i64,
    node: TimerRef,
}

/// A pinned slab of payload nodes
#[derive(Debug)]
struct PayloadChunk {
    base: NonNull<u8>,
    nodes: u32,
}

// node layout: one word holding the backlink (the node's current position
// in the key-record array), then the payload bytes
const NODE_HDR: usize = mem::size_of::<usize>();

#[derive(Debug)]
pub struct TimerHeap<A: Allocator = Global> {
    keys: NonNull<KeyRecord>,
    capacity: u32,
    elems: u32,
    value_size: usize,
    node_stride: usize,
    chunks: Vec<PayloadChunk>,
    resizable: bool,
    alloc: A,
}

impl TimerHeap<Global> {
    pub fn new(config: HeapConfig) -> FlowResult<Self> {
        Self::with_allocator(config, Global)
    }
}

impl<A: Allocator> TimerHeap<A> {
    pub fn with_allocator(config: HeapConfig, alloc: A) -> FlowResult<Self> {
        if config.value_size == 0 {
            return Err(FlowError::ZeroValueSize);
        }
        if config.max_elems == 0 {
            return Err(FlowError::ZeroCapacity);
        }
        let capacity = config.max_elems;
        let node_stride = NODE_HDR + word_align_up(config.value_size);
        let keys_layout =
            Layout::array::<KeyRecord>(capacity as usize).map_err(|_| FlowError::AllocFailed)?;
        let keys = alloc.allocate(keys_layout)?.cast::<KeyRecord>();
        let chunk = match Self::alloc_chunk(&alloc, node_stride, capacity) {
            Ok(chunk) => chunk,
            Err(e) => {
                unsafe {
                    // UNSAFE(@ohsayan): allocated right above with this layout
                    alloc.deallocate(keys.cast(), keys_layout);
                }
                return Err(e);
            }
        };
        let mut heap = Self {
            keys,
            capacity,
            elems: 0,
            value_size: config.value_size,
            node_stride,
            chunks: vec![chunk],
            resizable: config.resizable,
            alloc,
        };
        heap.pair_range(0, 0, capacity);
        Ok(heap)
    }

    fn alloc_chunk(alloc: &A, node_stride: usize, nodes: u32) -> FlowResult<PayloadChunk> {
        let base = alloc.allocate(slot_array_layout(node_stride, nodes as usize)?)?;
        Ok(PayloadChunk { base, nodes })
    }

    /// Cross-link key records `[first, first + count)` 1:1 with the nodes of
    /// `chunk`. Only ever called on records that are not part of the live heap
    fn pair_range(&mut self, chunk: u32, first: u32, count: u32) {
        for i in 0..count {
            let node = TimerRef { chunk, index: i };
            unsafe {
                // UNSAFE(@ohsayan): slots and nodes are in range by construction
                *self.key_ptr(first + i) = KeyRecord { key: 0, node };
            }
            self.write_backlink(node, first + i);
        }
    }

    pub fn len(&self) -> usize {
        self.elems as usize
    }
    pub fn is_empty(&self) -> bool {
        self.elems == 0
    }
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /*
        record/node plumbing
    */

    #[inline(always)]
    fn key_ptr(&self, slot: u32) -> *mut KeyRecord {
        debug_assert!(slot < self.capacity);
        unsafe {
            // UNSAFE(@ohsayan): in range per the debug assert; the array is
            // never handed out as a reference so this raw access can't alias
            self.keys.as_ptr().add(slot as usize)
        }
    }
    #[inline(always)]
    fn record(&self, slot: u32) -> KeyRecord {
        unsafe {
            // UNSAFE(@ohsayan): key_ptr bounds the slot
            *self.key_ptr(slot)
        }
    }
    #[inline(always)]
    fn key_at(&self, slot: u32) -> i64 {
        self.record(slot).key
    }
    #[inline(always)]
    fn node_ptr(&self, node: TimerRef) -> *mut u8 {
        let chunk = &self.chunks[node.chunk as usize];
        assert!(node.index < chunk.nodes, "timer handle out of range");
        unsafe {
            // UNSAFE(@ohsayan): in range per the assert
            chunk.base.as_ptr().add(self.node_stride * node.index as usize)
        }
    }
    #[inline(always)]
    fn backlink(&self, node: TimerRef) -> u32 {
        unsafe {
            // UNSAFE(@ohsayan): node header is an initialized word
            *(self.node_ptr(node) as *const u32)
        }
    }
    #[inline(always)]
    fn write_backlink(&mut self, node: TimerRef, slot: u32) {
        unsafe {
            // UNSAFE(@ohsayan): node header is ours to write
            *(self.node_ptr(node) as *mut u32) = slot;
        }
    }

    /// The payload bytes behind a handle. Readable even right after the
    /// entry was deleted (the node is only recycled by a later insert)
    pub fn payload(&self, node: TimerRef) -> &[u8] {
        unsafe {
            // UNSAFE(@ohsayan): node_ptr bounds the handle; payload spans
            // value_size bytes past the header
            slice::from_raw_parts(self.node_ptr(node).add(NODE_HDR), self.value_size)
        }
    }
    pub fn payload_mut(&mut self, node: TimerRef) -> &mut [u8] {
        unsafe {
            // UNSAFE(@ohsayan): see payload; &mut self excludes readers
            slice::from_raw_parts_mut(self.node_ptr(node).add(NODE_HDR), self.value_size)
        }
    }
    #[inline(always)]
    pub(crate) fn payload_ptr(&self, node: TimerRef) -> *const u8 {
        unsafe {
            // UNSAFE(@ohsayan): node_ptr bounds the handle
            self.node_ptr(node).add(NODE_HDR)
        }
    }

    /*
        heap order
    */

    #[inline(always)]
    const fn parent(i: u32) -> u32 {
        (i - 1) / 2
    }
    #[inline(always)]
    const fn left(i: u32) -> u32 {
        2 * i + 1
    }
    #[inline(always)]
    const fn right(i: u32) -> u32 {
        2 * i + 2
    }

    /// Swap two key records and repoint both payload backlinks. This is the
    /// only way records ever move, which is what keeps handles stable
    fn swap_key_records(&mut self, a: u32, b: u32) {
        unsafe {
            // UNSAFE(@ohsayan): both in range via key_ptr
            ptr::swap(self.key_ptr(a), self.key_ptr(b));
        }
        let node_a = self.record(a).node;
        let node_b = self.record(b).node;
        self.write_backlink(node_a, a);
        self.write_backlink(node_b, b);
    }

    /// Returns the index the record settled at
    fn sift_up(&mut self, mut i: u32) -> u32 {
        while i != 0 && self.key_at(Self::parent(i)) > self.key_at(i) {
            self.swap_key_records(i, Self::parent(i));
            i = Self::parent(i);
        }
        i
    }

    fn sift_down(&mut self, mut i: u32) {
        loop {
            let l = Self::left(i);
            let r = Self::right(i);
            let mut smallest = i;
            if l < self.elems && self.key_at(l) < self.key_at(smallest) {
                smallest = l;
            }
            if r < self.elems && self.key_at(r) < self.key_at(smallest) {
                smallest = r;
            }
            if smallest == i {
                break;
            }
            self.swap_key_records(i, smallest);
            // descend into the child we actually swapped with
            i = smallest;
        }
    }

    /*
        ops
    */

    /// Insert a key and get the handle to its (uninitialized) payload.
    /// Fails only on exhausted fixed capacity or allocation failure
    pub fn insert(&mut self, key: i64) -> FlowResult<TimerRef> {
        debug_assert!(key >= MIN_KEY, "keys below MIN_KEY are reserved");
        if self.elems == self.capacity {
            self.grow()?;
        }
        let tail = self.elems;
        unsafe {
            // UNSAFE(@ohsayan): tail record is in range (capacity > elems)
            (*self.key_ptr(tail)).key = key;
        }
        let settled = self.sift_up(tail);
        self.elems += 1;
        Ok(self.record(settled).node)
    }

    /// The smallest key, or [`NOT_FOUND`] when empty
    pub fn find_min(&self) -> i64 {
        if self.elems == 0 {
            NOT_FOUND
        } else {
            self.key_at(0)
        }
    }

    /// Pop the entry with the smallest key. The returned handle's payload
    /// stays readable until a later insert recycles the node
    pub fn delete_min(&mut self) -> Option<TimerRef> {
        if self.elems == 0 {
            return None;
        }
        self.elems -= 1;
        if self.elems == 0 {
            return Some(self.record(0).node);
        }
        // park the root record on the freed tail slot, then restore order
        self.swap_key_records(0, self.elems);
        self.sift_down(0);
        Some(self.record(self.elems).node)
    }

    /// Rebind the entry behind `node` to `new_key`, restoring heap order.
    /// Returns the new key, or [`NOT_FOUND`] if the handle is not live
    pub fn change_key(&mut self, node: TimerRef, new_key: i64) -> i64 {
        debug_assert!(new_key >= MIN_KEY, "keys below MIN_KEY are reserved");
        let slot = self.backlink(node);
        if slot >= self.elems || self.record(slot).node != node {
            return NOT_FOUND;
        }
        let old = self.key_at(slot);
        unsafe {
            // UNSAFE(@ohsayan): live slot per the check above
            (*self.key_ptr(slot)).key = new_key;
        }
        if new_key < old {
            self.sift_up(slot);
        } else if new_key > old {
            self.sift_down(slot);
        }
        new_key
    }

    /// Delete the entry behind `node`, returning its key. Hoists the record
    /// to the root by identity and pops it; a key-based hoist could pop a
    /// different record when keys tie
    pub fn remove(&mut self, node: TimerRef) -> Option<(i64, TimerRef)> {
        let slot = self.backlink(node);
        if slot >= self.elems || self.record(slot).node != node {
            return None;
        }
        let prior = self.key_at(slot);
        let mut i = slot;
        while i != 0 {
            self.swap_key_records(i, Self::parent(i));
            i = Self::parent(i);
        }
        let popped = self.delete_min();
        debug_assert_eq!(popped, Some(node));
        Some((prior, node))
    }

    /*
        growth
    */

    /// Double the capacity. Key records keep their positions (a plain
    /// realloc) and the payload pool gains one pinned chunk, so live
    /// handles and backlinks survive untouched
    fn grow(&mut self) -> FlowResult<()> {
        if !self.resizable {
            return Err(FlowError::CapacityExceeded);
        }
        let added = self.capacity;
        let new_cap = self
            .capacity
            .checked_mul(2)
            .ok_or(FlowError::CapacityExceeded)?;
        let chunk_layout = slot_array_layout(self.node_stride, added as usize)?;
        let chunk = PayloadChunk {
            base: self.alloc.allocate(chunk_layout)?,
            nodes: added,
        };
        let old_layout = Layout::array::<KeyRecord>(self.capacity as usize)
            .map_err(|_| FlowError::AllocFailed)?;
        let new_size = mem::size_of::<KeyRecord>() * new_cap as usize;
        let keys = unsafe {
            // UNSAFE(@ohsayan): self.keys is live with old_layout
            match self.alloc.reallocate(self.keys.cast(), old_layout, new_size) {
                Ok(block) => block.cast::<KeyRecord>(),
                Err(e) => {
                    // the heap is untouched; only the fresh chunk goes back
                    self.alloc.deallocate(chunk.base, chunk_layout);
                    return Err(e);
                }
            }
        };
        self.keys = keys;
        let chunk_id = self.chunks.len() as u32;
        self.chunks.push(chunk);
        let first = self.capacity;
        self.capacity = new_cap;
        self.pair_range(chunk_id, first, added);
        Ok(())
    }
}

impl<A: Allocator> Drop for TimerHeap<A> {
    fn drop(&mut self) {
        unsafe {
            // UNSAFE(@ohsayan): layouts recompute to exactly what was allocated
            let keys_layout = Layout::array::<KeyRecord>(self.capacity as usize).unwrap_unchecked();
            self.alloc.deallocate(self.keys.cast(), keys_layout);
            for chunk in &self.chunks {
                let layout = Layout::from_size_align_unchecked(
                    self.node_stride * chunk.nodes as usize,
                    mem::align_of::<usize>(),
                );
                self.alloc.deallocate(chunk.base, layout);
            }
        }
    }
}

unsafe impl<A: Allocator + Send> Send for TimerHeap<A> {}
unsafe impl<A: Allocator + Sync> Sync for TimerHeap<A> {}
