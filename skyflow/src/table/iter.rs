/*
 * Created on Sun Mar 17 2024
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

use {
    super::{FlowTable, ValueRef},
    crate::memory::Allocator,
    core::iter::FusedIterator,
};

/// Iterator over the occupied buckets of a [`FlowTable`] in bucket order,
/// yielding `(key bytes, value handle)`. The borrow on the table rules out
/// mutation while iterating
pub struct Entries<'a, A: Allocator> {
    table: &'a FlowTable<A>,
    at: u32,
}

impl<'a, A: Allocator> Entries<'a, A> {
    pub(super) fn new(table: &'a FlowTable<A>) -> Self {
        Self { table, at: 0 }
    }
}

impl<'a, A: Allocator> Iterator for Entries<'a, A> {
    type Item = (&'a [u8], ValueRef);
    fn next(&mut self) -> Option<Self::Item> {
        while self.at < self.table.indices() {
            let i = self.at;
            self.at += 1;
            if let Some(entry) = self.table.bucket_entry(i) {
                return Some(entry);
            }
        }
        None
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.table.len()))
    }
}

impl<'a, A: Allocator> FusedIterator for Entries<'a, A> {}
