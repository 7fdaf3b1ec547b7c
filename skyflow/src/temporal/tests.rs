/*
 * Created on Mon Mar 25 2024
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
    super::*,
    crate::{error::FlowError, table::TableConfig},
    rand::Rng,
    std::collections::HashMap,
};

fn session(max_elems: u32, resizable: bool) -> SessionTable {
    SessionTable::new(SessionConfig {
        table: TableConfig {
            key_size: 8,
            value_size: 8,
            max_elems,
            max_load_factor: 0.8,
            resizable,
        },
    })
    .unwrap()
}

fn k(i: u64) -> [u8; 8] {
    i.to_ne_bytes()
}

fn swept_keys(pairs: &[ExpiredPair<'_>]) -> Vec<u64> {
    pairs
        .iter()
        .map(|p| u64::from_ne_bytes(p.key.try_into().unwrap()))
        .collect()
}

#[test]
fn slot_registration_limit() {
    let mut s = session(16, false);
    for expect in 1..=MAX_TIMEOUT_SLOTS as u8 {
        assert_eq!(s.add_timeout_slot(100, 4, false).unwrap(), expect);
    }
    assert_eq!(
        s.add_timeout_slot(100, 4, false).unwrap_err(),
        FlowError::TooManySlots
    );
    assert_eq!(s.num_slots(), MAX_TIMEOUT_SLOTS);
}

#[test]
fn clock_is_monotonic() {
    let mut s = session(16, false);
    s.increase_global_time(100).unwrap();
    assert_eq!(
        s.increase_global_time(50).unwrap_err(),
        FlowError::ClockRegression
    );
    assert_eq!(s.last_timestamp(), 100);
    s.increase_global_time(100).unwrap();
}

#[test]
fn unknown_slot_is_rejected() {
    let mut s = session(16, false);
    assert_eq!(s.insert(&k(1), 1).unwrap_err(), FlowError::UnknownSlot);
    s.add_timeout_slot(10, 4, false).unwrap();
    assert_eq!(s.insert(&k(1), 2).unwrap_err(), FlowError::UnknownSlot);
    assert!(s.is_empty());
}

#[test]
fn untimed_entries_never_expire() {
    let mut s = session(16, false);
    s.add_timeout_slot(10, 4, false).unwrap();
    s.insert(&k(1), 0).unwrap();
    s.increase_global_time(1 << 40).unwrap();
    assert!(s.next_timeout_entries(usize::MAX).is_empty());
    assert_eq!(s.len(), 1);
}

#[test]
fn insert_is_idempotent_per_key() {
    let mut s = session(16, false);
    s.add_timeout_slot(10, 4, false).unwrap();
    let vref = s.insert(&k(7), 1).unwrap();
    s.value_mut(vref).copy_from_slice(&7u64.to_ne_bytes());
    // a second insert (even asking for a different slot) finds the entry
    // and books no second timer
    assert_eq!(s.insert(&k(7), 1).unwrap(), vref);
    assert_eq!(s.insert(&k(7), 0).unwrap(), vref);
    assert_eq!(s.len(), 1);
    assert_eq!(s.timed_count(), 1);
    s.check_coupling();
}

#[test]
fn remove_unbooks_the_timer() {
    let mut s = session(16, false);
    s.add_timeout_slot(10, 4, false).unwrap();
    s.insert(&k(1), 1).unwrap();
    s.insert(&k(2), 1).unwrap();
    s.insert(&k(3), 0).unwrap();
    assert_eq!(s.timed_count(), 2);
    assert!(s.remove(&k(1)).is_some());
    assert!(s.remove(&k(3)).is_some());
    assert!(s.remove(&k(1)).is_none());
    assert_eq!(s.len(), 1);
    assert_eq!(s.timed_count(), 1);
    s.check_coupling();
}

#[test]
fn insert_rolls_back_when_the_slot_is_full() {
    let mut s = session(16, false);
    s.add_timeout_slot(10, 1, false).unwrap();
    s.insert(&k(1), 1).unwrap();
    assert_eq!(s.insert(&k(2), 1).unwrap_err(), FlowError::CapacityExceeded);
    // the hash entry was rolled back with the refused timer
    assert!(s.lookup(&k(2)).is_none());
    assert_eq!(s.len(), 1);
    assert_eq!(s.timed_count(), 1);
    s.check_coupling();
}

#[test]
fn two_slot_timeouts() {
    let mut s = session(100, false);
    assert_eq!(s.add_timeout_slot(50, 64, true).unwrap(), 1);
    assert_eq!(s.add_timeout_slot(200, 64, true).unwrap(), 2);
    s.increase_global_time(1000).unwrap();
    for i in 0u64..100 {
        s.insert(&k(i), 0).unwrap();
    }
    s.increase_global_time(2000).unwrap();
    assert!(s.next_timeout_entries(usize::MAX).is_empty());

    // key 5 picks up slot 1 at clock 2000; keys 10..30 at 2010..2029
    s.set_timeout_slot(&k(5), 1).unwrap();
    for i in 10u64..30 {
        s.increase_global_time(2000 + i as i64).unwrap();
        s.set_timeout_slot(&k(i), 1).unwrap();
    }
    s.check_coupling();

    s.increase_global_time(2050).unwrap();
    assert_eq!(swept_keys(&s.next_timeout_entries(usize::MAX)), vec![5]);

    s.increase_global_time(2064).unwrap();
    assert_eq!(
        swept_keys(&s.next_timeout_entries(usize::MAX)),
        vec![10, 11, 12, 13, 14]
    );

    // move the middle of the pack to the slow slot; timestamps travel along
    for i in 15u64..25 {
        s.set_timeout_slot(&k(i), 2).unwrap();
    }
    s.check_coupling();

    s.increase_global_time(2080).unwrap();
    assert_eq!(
        swept_keys(&s.next_timeout_entries(usize::MAX)),
        vec![25, 26, 27, 28, 29]
    );

    // the moved entries still carry their slot-1 pickup times (2015..2024),
    // so the 200 tick timeout runs out at 2215..2224
    s.increase_global_time(2214).unwrap();
    assert!(s.next_timeout_entries(usize::MAX).is_empty());
    s.increase_global_time(2224).unwrap();
    assert_eq!(
        swept_keys(&s.next_timeout_entries(usize::MAX)),
        (15u64..25).collect::<Vec<_>>()
    );
    assert_eq!(s.timed_count(), 0);
    assert_eq!(s.len(), 100 - 1 - 5 - 5 - 10);
    s.check_coupling();
}

#[test]
fn update_time_defers_expiry() {
    let mut s = session(16, false);
    s.add_timeout_slot(1000, 4, false).unwrap();
    s.increase_global_time(1000).unwrap();
    s.insert(&k(7), 1).unwrap();
    s.increase_global_time(1001).unwrap();
    s.insert(&k(9), 1).unwrap();

    s.increase_global_time(1999).unwrap();
    assert!(s.next_timeout_entries(usize::MAX).is_empty());

    s.update_time_for_entry(&k(7), 2500).unwrap();

    s.increase_global_time(2001).unwrap();
    assert_eq!(swept_keys(&s.next_timeout_entries(usize::MAX)), vec![9]);

    s.increase_global_time(3500).unwrap();
    assert_eq!(swept_keys(&s.next_timeout_entries(usize::MAX)), vec![7]);
    s.check_coupling();
}

#[test]
fn update_time_rejections() {
    let mut s = session(16, false);
    s.add_timeout_slot(10, 4, false).unwrap();
    s.increase_global_time(100).unwrap();
    s.insert(&k(1), 1).unwrap();
    s.insert(&k(2), 0).unwrap();
    // behind the clock
    assert!(s.update_time_for_entry(&k(1), 99).is_none());
    // untimed entry
    assert!(s.update_time_for_entry(&k(2), 200).is_none());
    // absent key
    assert!(s.update_time_for_entry(&k(3), 200).is_none());
    s.check_coupling();
}

#[test]
fn slot_moves() {
    let mut s = session(16, false);
    s.add_timeout_slot(50, 4, false).unwrap();
    s.add_timeout_slot(200, 1, false).unwrap();
    s.increase_global_time(1000).unwrap();
    s.insert(&k(1), 1).unwrap();

    // same slot: no-op
    s.set_timeout_slot(&k(1), 1).unwrap();
    assert_eq!(s.timed_count(), 1);

    // slot 0 and bad ids are rejected
    assert!(s.set_timeout_slot(&k(1), 0).is_none());
    assert!(s.set_timeout_slot(&k(1), 3).is_none());
    assert!(s.set_timeout_slot(&k(404), 1).is_none());

    // 1 -> 2 preserves the timestamp: expiry is 1000 + 200
    s.increase_global_time(1100).unwrap();
    s.set_timeout_slot(&k(1), 2).unwrap();
    s.increase_global_time(1199).unwrap();
    assert!(s.next_timeout_entries(usize::MAX).is_empty());
    s.increase_global_time(1200).unwrap();
    assert_eq!(swept_keys(&s.next_timeout_entries(usize::MAX)), vec![1]);

    // picking up an untimed entry stamps it with the current clock
    s.insert(&k(2), 0).unwrap();
    s.set_timeout_slot(&k(2), 1).unwrap();
    s.increase_global_time(1249).unwrap();
    assert!(s.next_timeout_entries(usize::MAX).is_empty());
    s.increase_global_time(1250).unwrap();
    assert_eq!(swept_keys(&s.next_timeout_entries(usize::MAX)), vec![2]);
    s.check_coupling();
}

#[test]
fn slot_move_to_full_slot_restores_the_entry() {
    let mut s = session(16, false);
    s.add_timeout_slot(50, 4, false).unwrap();
    s.add_timeout_slot(200, 1, false).unwrap();
    s.increase_global_time(1000).unwrap();
    s.insert(&k(1), 2).unwrap();
    s.insert(&k(2), 1).unwrap();
    // slot 2 is full: the move is refused and key 2 stays in slot 1
    assert!(s.set_timeout_slot(&k(2), 2).is_none());
    s.check_coupling();
    assert_eq!(s.timed_count(), 2);
    s.increase_global_time(1050).unwrap();
    assert_eq!(swept_keys(&s.next_timeout_entries(usize::MAX)), vec![2]);
}

#[test]
fn sweep_respects_the_limit() {
    let mut s = session(16, false);
    s.add_timeout_slot(10, 8, false).unwrap();
    s.increase_global_time(0).unwrap();
    for i in 0u64..6 {
        s.increase_global_time(i as i64).unwrap();
        s.insert(&k(i), 1).unwrap();
    }
    s.increase_global_time(1000).unwrap();
    assert_eq!(swept_keys(&s.next_timeout_entries(2)), vec![0, 1]);
    assert_eq!(swept_keys(&s.next_timeout_entries(2)), vec![2, 3]);
    assert_eq!(swept_keys(&s.next_timeout_entries(usize::MAX)), vec![4, 5]);
    assert!(s.next_timeout_entries(usize::MAX).is_empty());
    assert!(s.is_empty());
}

#[test]
fn swept_pairs_carry_the_values() {
    let mut s = session(16, false);
    s.add_timeout_slot(10, 8, false).unwrap();
    for i in 0u64..4 {
        let vref = s.insert(&k(i), 1).unwrap();
        s.value_mut(vref).copy_from_slice(&(i * 1000).to_ne_bytes());
    }
    s.increase_global_time(100).unwrap();
    let pairs = s.next_timeout_entries(usize::MAX);
    assert_eq!(pairs.len(), 4);
    for pair in &pairs {
        let key = u64::from_ne_bytes(pair.key.try_into().unwrap());
        let value = u64::from_ne_bytes(pair.value.try_into().unwrap());
        assert_eq!(value, key * 1000);
    }
}

#[test]
fn timers_survive_table_growth() {
    // a tiny resizable table under 512 timed entries: the bucket array is
    // rebuilt many times over while every entry holds a live timer handle
    // in its value prefix
    let mut s = session(1, true);
    s.add_timeout_slot(100, 4, true).unwrap();
    for i in 0u64..512 {
        s.increase_global_time(i as i64).unwrap();
        let vref = s.insert(&k(i), 1).unwrap();
        s.value_mut(vref).copy_from_slice(&i.to_ne_bytes());
    }
    s.check_coupling();
    assert_eq!(s.timed_count(), 512);
    // everything expires by 511 + 100
    s.increase_global_time(611).unwrap();
    let pairs = s.next_timeout_entries(usize::MAX);
    assert_eq!(pairs.len(), 512);
    // the heap drains in timestamp order, which is insertion order here
    for (i, pair) in pairs.iter().enumerate() {
        assert_eq!(u64::from_ne_bytes(pair.key.try_into().unwrap()), i as u64);
        assert_eq!(u64::from_ne_bytes(pair.value.try_into().unwrap()), i as u64);
    }
    assert!(s.is_empty());
}

#[test]
fn randomized_sweep_completeness() {
    let mut rng = rand::thread_rng();
    let mut s = session(64, true);
    s.add_timeout_slot(25, 4, true).unwrap();
    s.add_timeout_slot(75, 4, true).unwrap();
    s.add_timeout_slot(250, 4, true).unwrap();
    let timeouts = [25i64, 75, 250];

    // expiry time per live key, as the model sees it
    let mut model: HashMap<u64, i64> = HashMap::new();
    let mut clock = 0i64;
    let mut next_key = 0u64;
    for _ in 0..64 {
        clock += rng.gen_range(1..20);
        s.increase_global_time(clock).unwrap();
        for _ in 0..rng.gen_range(1..8) {
            let slot = rng.gen_range(1u8..=3);
            let key = next_key;
            next_key += 1;
            s.insert(&k(key), slot).unwrap();
            model.insert(key, clock + timeouts[slot as usize - 1]);
        }
        let due: Vec<u64> = model
            .iter()
            .filter(|(_, expiry)| **expiry <= clock)
            .map(|(key, _)| *key)
            .collect();
        let swept = swept_keys(&s.next_timeout_entries(usize::MAX));
        assert_eq!(swept.len(), due.len());
        for key in swept {
            assert!(model.remove(&key).is_some(), "swept {key} twice or early");
        }
        s.check_coupling();
        assert_eq!(s.len(), model.len());
    }
    // drain the rest
    clock += 1000;
    s.increase_global_time(clock).unwrap();
    let swept = swept_keys(&s.next_timeout_entries(usize::MAX));
    assert_eq!(swept.len(), model.len());
    assert!(s.is_empty());
    assert_eq!(s.timed_count(), 0);
}
