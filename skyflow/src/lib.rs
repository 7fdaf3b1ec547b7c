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

//! # Skyflow
//!
//! Embeddable containers for session/flow tables with timeout eviction:
//!
//! - [`FlowTable`]: a Robin Hood linear-probing hash table over fixed-size
//!   opaque keys and values, with back-shift deletion and pooled value
//!   storage that keeps value handles stable across growth
//! - [`TimerHeap`]: an indirect binary min-heap over `i64` keys whose
//!   payload nodes are pinned, so handles survive every reorganization
//! - [`SessionTable`]: one table plus up to 127 timeout slots (each a
//!   heap with a timeout delta) under a monotonic clock, evicting entries
//!   whose timestamp plus slot timeout has passed
//!
//! All three are single-threaded cooperative objects: no locks, no
//! blocking, no global state. Memory comes from an injectable [`Allocator`]
//! ([`Global`] by default, or caller function pointers via
//! [`MemoryHooks`]), which is what makes the containers embeddable in
//! hosts that arena- or instrument their allocations.

mod error;
mod hash;
pub mod heap;
pub mod memory;
pub mod table;
pub mod temporal;

pub use {
    error::{FlowError, FlowResult},
    heap::{HeapConfig, TimerHeap, TimerRef},
    memory::{Allocator, Global, MemoryHooks},
    table::{Entries, FlowTable, TableConfig, TableStatus, ValueRef},
    temporal::{ExpiredPair, SessionConfig, SessionTable, MAX_TIMEOUT_SLOTS},
};
