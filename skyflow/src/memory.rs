/*
 * Created on Fri Mar 08 2024
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

//! Primitive methods for allocation
//!
//! Every byte the containers own is acquired through the [`Allocator`]
//! trait. [`Global`] is the process heap; [`MemoryHooks`] routes through
//! caller supplied function pointers with an opaque cookie, which is what
//! lets the containers live inside a host application's arena or
//! instrumented allocator without the containers knowing.

use {
    crate::error::{FlowError, FlowResult},
    core::{ffi::c_void, ptr, ptr::NonNull},
    std::alloc::{self, Layout},
};

/// `malloc(size, cookie)`
pub type MallocHook = unsafe extern "C" fn(size: usize, cookie: *mut c_void) -> *mut c_void;
/// `realloc(ptr, size, cookie)`
pub type ReallocHook =
    unsafe extern "C" fn(ptr: *mut c_void, size: usize, cookie: *mut c_void) -> *mut c_void;
/// `free(ptr, cookie)`
pub type FreeHook = unsafe extern "C" fn(ptr: *mut c_void, cookie: *mut c_void);

/// An allocator the containers route every acquisition through. The trait is
/// kept deliberately tiny; the containers only ever ask for word-aligned
/// blocks whose sizes they computed themselves
///
/// ## Safety
///
/// An implementation must return blocks that satisfy the requested layout
/// and must accept every block it handed out back in [`Allocator::deallocate`]
/// with the layout it was allocated with
pub unsafe trait Allocator {
    /// A pointer to the new allocation is returned on success
    fn allocate(&self, layout: Layout) -> FlowResult<NonNull<u8>>;
    /// Like [`Allocator::allocate`], but the returned region is zeroed. The
    /// default implementation zeroes explicitly, so an implementation backed
    /// by a non-zeroing `malloc` stays correct
    fn allocate_zeroed(&self, layout: Layout) -> FlowResult<NonNull<u8>> {
        let block = self.allocate(layout)?;
        unsafe {
            // UNSAFE(@ohsayan): fresh block of exactly layout.size() bytes
            ptr::write_bytes(block.as_ptr(), 0, layout.size());
        }
        Ok(block)
    }
    /// Grow (or shrink) a block to `new_size` bytes, preserving the prefix.
    /// On failure the original block is left untouched and still owned by
    /// the caller
    ///
    /// ## Safety
    /// `ptr` must denote a live block of this allocator with layout `layout`
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> FlowResult<NonNull<u8>> {
        let new_layout =
            Layout::from_size_align(new_size, layout.align()).map_err(|_| FlowError::AllocFailed)?;
        let new_block = self.allocate(new_layout)?;
        // UNSAFE(@ohsayan): distinct blocks; copy the smaller extent
        ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_block.as_ptr(),
            layout.size().min(new_size),
        );
        self.deallocate(ptr, layout);
        Ok(new_block)
    }
    /// Return a block
    ///
    /// ## Safety
    /// `ptr` must denote a live block of this allocator with layout `layout`
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global allocator (the process heap)
#[derive(Debug, Clone, Copy, Default)]
pub struct Global;

unsafe impl Allocator for Global {
    fn allocate(&self, layout: Layout) -> FlowResult<NonNull<u8>> {
        debug_assert_ne!(layout.size(), 0);
        NonNull::new(unsafe {
            // UNSAFE(@ohsayan): nonzero size asserted above
            alloc::alloc(layout)
        })
        .ok_or(FlowError::AllocFailed)
    }
    fn allocate_zeroed(&self, layout: Layout) -> FlowResult<NonNull<u8>> {
        debug_assert_ne!(layout.size(), 0);
        NonNull::new(unsafe {
            // UNSAFE(@ohsayan): nonzero size asserted above
            alloc::alloc_zeroed(layout)
        })
        .ok_or(FlowError::AllocFailed)
    }
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> FlowResult<NonNull<u8>> {
        // UNSAFE(@ohsayan): caller upholds block liveness; realloc keeps the
        // old block alive on failure
        NonNull::new(alloc::realloc(ptr.as_ptr(), layout, new_size)).ok_or(FlowError::AllocFailed)
    }
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// Caller supplied allocation hooks with an opaque cookie that is passed
/// back on every call. Any hook left unset falls back to [`Global`]. The
/// hooks own no state of their own and are exactly as reentrant as the
/// functions behind them
///
/// Hooks must return memory aligned for the requested layout; the containers
/// never ask for more than machine word alignment, which any `malloc`
/// shaped function already guarantees
#[derive(Debug, Clone, Copy)]
pub struct MemoryHooks {
    malloc: Option<MallocHook>,
    realloc: Option<ReallocHook>,
    free: Option<FreeHook>,
    cookie: *mut c_void,
}

impl MemoryHooks {
    pub const fn new(
        malloc: Option<MallocHook>,
        realloc: Option<ReallocHook>,
        free: Option<FreeHook>,
        cookie: *mut c_void,
    ) -> Self {
        Self {
            malloc,
            realloc,
            free,
            cookie,
        }
    }
    pub const fn cookie(&self) -> *mut c_void {
        self.cookie
    }
}

impl Default for MemoryHooks {
    fn default() -> Self {
        Self::new(None, None, None, ptr::null_mut())
    }
}

unsafe impl Allocator for MemoryHooks {
    fn allocate(&self, layout: Layout) -> FlowResult<NonNull<u8>> {
        match self.malloc {
            Some(malloc) => NonNull::new(unsafe {
                // UNSAFE(@ohsayan): the hook contract is malloc shaped
                malloc(layout.size(), self.cookie) as *mut u8
            })
            .ok_or(FlowError::AllocFailed),
            None => Global.allocate(layout),
        }
    }
    fn allocate_zeroed(&self, layout: Layout) -> FlowResult<NonNull<u8>> {
        match self.malloc {
            Some(_) => {
                // zero ourselves; the hook makes no calloc promise
                let block = self.allocate(layout)?;
                unsafe {
                    // UNSAFE(@ohsayan): fresh block of exactly layout.size() bytes
                    ptr::write_bytes(block.as_ptr(), 0, layout.size());
                }
                Ok(block)
            }
            None => Global.allocate_zeroed(layout),
        }
    }
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> FlowResult<NonNull<u8>> {
        match self.realloc {
            Some(realloc) => {
                // UNSAFE(@ohsayan): caller upholds block liveness
                NonNull::new(realloc(ptr.as_ptr() as *mut c_void, new_size, self.cookie) as *mut u8)
                    .ok_or(FlowError::AllocFailed)
            }
            None => match self.malloc {
                // mixed hook set: stay inside the hooks for the new block
                Some(_) => {
                    let new_block = self.allocate(
                        Layout::from_size_align(new_size, layout.align())
                            .map_err(|_| FlowError::AllocFailed)?,
                    )?;
                    // UNSAFE(@ohsayan): distinct blocks; copy the smaller extent
                    ptr::copy_nonoverlapping(
                        ptr.as_ptr(),
                        new_block.as_ptr(),
                        layout.size().min(new_size),
                    );
                    self.deallocate(ptr, layout);
                    Ok(new_block)
                }
                None => Global.reallocate(ptr, layout, new_size),
            },
        }
    }
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match self.free {
            // UNSAFE(@ohsayan): caller upholds block liveness
            Some(free) => free(ptr.as_ptr() as *mut c_void, self.cookie),
            None => Global.deallocate(ptr, layout),
        }
    }
}

/// Round `n` up to the next multiple of the machine word size. All bucket
/// and payload strides go through this so that every slot a container hands
/// out is at least pointer aligned
#[inline(always)]
pub(crate) const fn word_align_up(n: usize) -> usize {
    const WORD: usize = core::mem::size_of::<usize>();
    (n + (WORD - 1)) & !(WORD - 1)
}

/// Layout for `n` word-aligned slots of `stride` bytes each
#[inline(always)]
pub(crate) fn slot_array_layout(stride: usize, n: usize) -> FlowResult<Layout> {
    debug_assert_eq!(stride % core::mem::size_of::<usize>(), 0);
    let size = stride.checked_mul(n).ok_or(FlowError::AllocFailed)?;
    Layout::from_size_align(size, core::mem::align_of::<usize>())
        .map_err(|_| FlowError::AllocFailed)
}
