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

//! The byte-string hash the table probes from. Keys are opaque bytes, so
//! the only requirement here is a fast, well-mixed word-at-a-time hash;
//! the rotate-xor-multiply schedule below is the same one our index
//! hashers use

const ROTATE: u32 = 5;
const PRIME64: u64 = 0x517CC1B727220A95; // archimedes (obtained from rustc)

#[inline(always)]
fn mix(state: u64, word: u64) -> u64 {
    (state.rotate_left(ROTATE) ^ word).wrapping_mul(PRIME64)
}

/// Hash an opaque key. 8-byte words first, then the 4/2/1 byte tail
pub fn hash_bytes(mut bytes: &[u8]) -> u64 {
    let mut state = 0u64;
    while bytes.len() >= 8 {
        state = mix(
            state,
            u64::from_ne_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
        );
        bytes = &bytes[8..];
    }
    if bytes.len() >= 4 {
        state = mix(
            state,
            u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        );
        bytes = &bytes[4..];
    }
    if bytes.len() >= 2 {
        state = mix(state, u16::from_ne_bytes([bytes[0], bytes[1]]) as u64);
        bytes = &bytes[2..];
    }
    if !bytes.is_empty() {
        state = mix(state, bytes[0] as u64);
    }
    state
}

/// Map a 32-bit hash into `[0, p)` with a multiply-shift instead of a
/// modulo (a division can cost an order of magnitude more cycles than the
/// widening multiply)
#[inline(always)]
pub const fn map_range_u32(word: u32, p: u32) -> u32 {
    (((word as u64) * (p as u64)) >> 32) as u32
}
