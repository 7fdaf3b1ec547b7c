/*
 * Created on Thu Mar 21 2024
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

use {super::*, rand::Rng, std::collections::HashSet};

#[cfg(not(miri))]
const RESIZE_SPAM: u64 = 1_000_000;
#[cfg(miri)]
const RESIZE_SPAM: u64 = 512;

fn cfg(max_elems: u32, load: f64, resizable: bool) -> TableConfig {
    TableConfig {
        key_size: 8,
        value_size: 8,
        max_elems,
        max_load_factor: load,
        resizable,
    }
}

fn k(i: u64) -> [u8; 8] {
    i.to_ne_bytes()
}

fn put(t: &mut FlowTable, i: u64) -> ValueRef {
    let vref = t.insert(&k(i)).unwrap();
    t.value_mut(vref).copy_from_slice(&i.to_ne_bytes());
    vref
}

fn read(t: &FlowTable, vref: ValueRef) -> u64 {
    u64::from_ne_bytes(t.value(vref).try_into().unwrap())
}

#[test]
fn bad_config() {
    use crate::error::FlowError;
    let base = cfg(16, 0.8, false);
    let reject = |patch: fn(&mut TableConfig), expect: FlowError| {
        let mut c = base;
        patch(&mut c);
        assert_eq!(FlowTable::new(c).unwrap_err(), expect);
    };
    reject(|c| c.key_size = 0, FlowError::ZeroKeySize);
    reject(|c| c.value_size = 0, FlowError::ZeroValueSize);
    reject(|c| c.max_elems = 0, FlowError::ZeroCapacity);
    reject(|c| c.max_load_factor = 0.0, FlowError::BadLoadFactor);
    reject(|c| c.max_load_factor = 1.0, FlowError::BadLoadFactor);
    reject(|c| c.max_load_factor = -0.5, FlowError::BadLoadFactor);
}

#[test]
fn insert_lookup_bijection() {
    let mut t = FlowTable::new(cfg(64, 0.8, false)).unwrap();
    let vref = put(&mut t, 42);
    // idempotent: the same slot comes back and nothing is added
    assert_eq!(t.insert(&k(42)).unwrap(), vref);
    assert_eq!(t.lookup(&k(42)).unwrap(), vref);
    assert_eq!(t.len(), 1);
    assert!(t.lookup(&k(43)).is_none());
    assert_eq!(t.remove(&k(42)).unwrap(), vref);
    assert!(t.lookup(&k(42)).is_none());
    assert!(t.remove(&k(42)).is_none());
    assert!(t.is_empty());
}

#[test]
fn churn_without_resize() {
    let mut t = FlowTable::new(cfg(500, 0.9, false)).unwrap();
    for i in 0u64..500 {
        put(&mut t, i);
    }
    assert_eq!(t.len(), 500);
    t.check_probe_invariant();
    for i in 0u64..500 {
        let vref = t.remove(&k(i)).unwrap();
        // the vacated slot still reads this entry's value
        assert_eq!(read(&t, vref), i);
        assert!(t.lookup(&k(i)).is_none());
        for j in (i + 1)..500 {
            let survivor = t.lookup(&k(j)).unwrap();
            assert_eq!(read(&t, survivor), j);
        }
    }
    assert!(t.is_empty());
    t.check_probe_invariant();
}

#[test]
fn full_fixed_table_refuses() {
    use crate::error::FlowError;
    let mut t = FlowTable::new(cfg(8, 0.7, false)).unwrap();
    for i in 0u64..8 {
        put(&mut t, i);
    }
    assert_eq!(t.insert(&k(100)).unwrap_err(), FlowError::CapacityExceeded);
    // existing keys still resolve, even at capacity
    let vref3 = t.insert(&k(3)).unwrap();
    assert_eq!(read(&t, vref3), 3);
    t.remove(&k(0)).unwrap();
    put(&mut t, 100);
    assert_eq!(t.len(), 8);
}

#[test]
fn resize_stress() {
    let mut t = FlowTable::new(cfg(1, 0.6, true)).unwrap();
    let mut checkpoints = Vec::new();
    for i in 0..RESIZE_SPAM {
        let vref = t.insert(&k(i)).unwrap();
        t.value_mut(vref).copy_from_slice(&i.to_ne_bytes());
        if i.count_ones() <= 1 {
            // power-of-two checkpoints: everything inserted so far resolves
            checkpoints.push(i);
            for &c in &checkpoints {
                assert_eq!(read(&t, t.lookup(&k(c)).unwrap()), c);
            }
        }
    }
    assert_eq!(t.len(), RESIZE_SPAM as usize);
    assert_eq!(t.status().elems_in_use, RESIZE_SPAM as u32);
    for i in 0..RESIZE_SPAM {
        assert_eq!(read(&t, t.lookup(&k(i)).unwrap()), i);
    }
}

#[test]
fn refs_survive_resize() {
    let mut t = FlowTable::new(cfg(1, 0.6, true)).unwrap();
    let early = put(&mut t, 7);
    for i in 100u64..1100 {
        put(&mut t, i);
    }
    // the pool never moved the early slot, so the old handle still works
    assert_eq!(read(&t, early), 7);
    assert_eq!(t.lookup(&k(7)).unwrap(), early);
}

#[test]
fn probe_invariant_random_churn() {
    let mut rng = rand::thread_rng();
    let mut t = FlowTable::new(cfg(128, 0.85, true)).unwrap();
    let mut model: HashSet<u64> = HashSet::new();
    for round in 0..64 {
        for _ in 0..32 {
            let key = rng.gen_range(0u64..512);
            if rng.gen_bool(0.6) {
                put(&mut t, key);
                model.insert(key);
            } else {
                assert_eq!(t.remove(&k(key)).is_some(), model.remove(&key));
            }
        }
        t.check_probe_invariant();
        assert_eq!(t.len(), model.len(), "diverged on round {round}");
    }
    for key in &model {
        assert_eq!(read(&t, t.lookup(&k(*key)).unwrap()), *key);
    }
}

#[test]
fn iteration_is_complete() {
    let mut t = FlowTable::new(cfg(256, 0.8, false)).unwrap();
    let mut expect = HashSet::new();
    for i in (0u64..500).step_by(3) {
        put(&mut t, i);
        expect.insert(i);
    }
    let mut seen = HashSet::new();
    for (key, vref) in t.iter() {
        let key = u64::from_ne_bytes(key.try_into().unwrap());
        assert_eq!(read(&t, vref), key);
        assert!(seen.insert(key), "bucket visited twice");
    }
    assert_eq!(seen, expect);
}

#[test]
fn reserve_overrides_fixed_sizing() {
    let mut t = FlowTable::new(cfg(4, 0.7, false)).unwrap();
    for i in 0u64..4 {
        put(&mut t, i);
    }
    t.reserve(64).unwrap();
    assert_eq!(t.status().max_elems, 64);
    for i in 4u64..64 {
        put(&mut t, i);
    }
    // reserve does not make the table permanently resizable
    assert!(t.insert(&k(1000)).is_err());
    for i in 0u64..64 {
        assert_eq!(read(&t, t.lookup(&k(i)).unwrap()), i);
    }
}

#[test]
fn clear_keeps_capacity() {
    let mut t = FlowTable::new(cfg(32, 0.8, false)).unwrap();
    for i in 0u64..32 {
        put(&mut t, i);
    }
    t.clear();
    assert!(t.is_empty());
    assert!(t.lookup(&k(5)).is_none());
    assert_eq!(t.iter().count(), 0);
    for i in 0u64..32 {
        put(&mut t, i);
    }
    assert_eq!(t.len(), 32);
    t.check_probe_invariant();
}

#[test]
fn status_reporting() {
    let mut t = FlowTable::new(cfg(100, 0.5, false)).unwrap();
    let empty = t.status();
    assert_eq!(empty.max_elems, 100);
    assert_eq!(empty.elems_in_use, 0);
    assert_eq!(empty.current_load_factor, 0.0);
    assert!(empty.size_in_bytes > 0);
    for i in 0u64..50 {
        put(&mut t, i);
    }
    let half = t.status();
    assert_eq!(half.elems_in_use, 50);
    assert!(half.current_load_factor > 0.0 && half.current_load_factor < 0.5);
    assert_eq!(half.size_in_bytes, empty.size_in_bytes);
}

#[test]
#[should_panic(expected = "key length")]
fn wrong_key_length_panics() {
    let t = FlowTable::new(cfg(8, 0.8, false)).unwrap();
    let _ = t.lookup(&[0u8; 4]);
}
