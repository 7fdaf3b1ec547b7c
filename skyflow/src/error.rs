/*
 * Created on Sat Mar 09 2024
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

pub type FlowResult<T> = Result<T, FlowError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Container errors. Absence of a key is not an error and is signalled
/// through `Option`/sentinel returns instead
pub enum FlowError {
    // config
    /// The configured key size was zero
    ZeroKeySize,
    /// The configured value size was zero
    ZeroValueSize,
    /// The configured element capacity was zero
    ZeroCapacity,
    /// The configured load factor was outside (0, 1)
    BadLoadFactor,
    // runtime
    /// The container is full and was not configured to grow
    CapacityExceeded,
    /// The allocator returned no memory; the container is unchanged
    AllocFailed,
    // temporal
    /// All timeout slot ids are in use
    TooManySlots,
    /// The given slot id does not name a configured timeout slot
    UnknownSlot,
    /// The global clock may never run backwards
    ClockRegression,
}

impl FlowError {
    /// True for errors that reject a configuration before any allocation
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ZeroKeySize | Self::ZeroValueSize | Self::ZeroCapacity | Self::BadLoadFactor
        )
    }
}
