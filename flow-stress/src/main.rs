/*
 * Created on Sat Apr 06 2024
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

//! Correctness-under-load soak for the skyflow containers: every phase runs
//! a randomized workload against a std reference model and panics on the
//! first divergence. Sizes scale with the first CLI argument (a multiplier,
//! default 1). Set `FLOW_LOG` to tune verbosity.

#![deny(unused_crate_dependencies)]
#![deny(unused_imports)]

use {
    devtimer::DevTime,
    log::{info, warn},
    rand::{rngs::ThreadRng, Rng},
    skyflow::{FlowTable, HeapConfig, SessionConfig, SessionTable, TableConfig, TimerHeap},
    std::{
        collections::{BTreeMap, HashMap},
        env,
    },
};

#[cfg(all(not(target_env = "msvc"), not(miri)))]
use jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), not(miri)))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const BASE_OPS: usize = 100_000;

macro_rules! logstress {
    ($stressid:expr, $extra:expr) => {
        log::info!("Stress ({}): {}", $stressid, $extra);
    };
}

fn main() {
    env_logger::Builder::new()
        .parse_filters(&env::var("FLOW_LOG").unwrap_or_else(|_| "trace".to_owned()))
        .init();
    warn!("The stress test checks correctness under load and DOES NOT show the true throughput");
    let scale: usize = env::args()
        .nth(1)
        .map(|arg| arg.parse().expect("scale must be a positive integer"))
        .unwrap_or(1);
    let ops = BASE_OPS * scale;
    info!("Running all phases with {ops} operations each");
    let mut rng = rand::thread_rng();
    let mut timer = DevTime::new_simple();

    timer.start();
    stress_table_churn(&mut rng, ops);
    timer.stop();
    info!("Phase A done in {}ms", timer.time_in_millis().unwrap());

    timer.start();
    stress_heap_order(&mut rng, ops);
    timer.stop();
    info!("Phase B done in {}ms", timer.time_in_millis().unwrap());

    timer.start();
    stress_session_sweep(&mut rng, ops / 10);
    timer.stop();
    info!("Phase C done in {}ms", timer.time_in_millis().unwrap());

    info!("SUCCESS. Stress test complete!");
}

/// Random insert/remove/lookup churn against a `HashMap` model
fn stress_table_churn(rng: &mut ThreadRng, ops: usize) {
    logstress!("A [TABLE]", "random churn against a HashMap model");
    let mut table = FlowTable::new(TableConfig {
        key_size: 8,
        value_size: 8,
        max_elems: 64,
        max_load_factor: 0.85,
        resizable: true,
    })
    .unwrap();
    let mut model: HashMap<u64, u64> = HashMap::new();
    for op in 0..ops {
        let key = rng.gen_range(0u64..(ops as u64 / 4).max(16));
        let kb = key.to_ne_bytes();
        match rng.gen_range(0u8..10) {
            0..=5 => {
                let value = rng.gen::<u64>();
                let vref = table.insert(&kb).unwrap();
                table.value_mut(vref).copy_from_slice(&value.to_ne_bytes());
                model.insert(key, value);
            }
            6..=8 => {
                let mine = table.remove(&kb).is_some();
                let model_had = model.remove(&key).is_some();
                assert_eq!(mine, model_had, "remove diverged at op {op} (key {key})");
            }
            _ => {
                let mine = table
                    .lookup(&kb)
                    .map(|vref| u64::from_ne_bytes(table.value(vref).try_into().unwrap()));
                assert_eq!(mine, model.get(&key).copied(), "lookup diverged at op {op}");
            }
        }
        assert_eq!(table.len(), model.len());
    }
    info!(
        "Phase A: final population {} at load factor {:.3}",
        table.len(),
        table.status().current_load_factor
    );
}

/// Random keyed inserts and drains against an ordered model
fn stress_heap_order(rng: &mut ThreadRng, ops: usize) {
    logstress!("B [HEAP]", "ordered drain against a BTreeMap model");
    let mut heap = TimerHeap::new(HeapConfig {
        value_size: 8,
        max_elems: 16,
        resizable: true,
    })
    .unwrap();
    // key -> multiset count
    let mut model: BTreeMap<i64, usize> = BTreeMap::new();
    let mut live = 0usize;
    for op in 0..ops {
        if live == 0 || rng.gen_bool(0.6) {
            let key = rng.gen_range(-1_000_000i64..1_000_000);
            let node = heap.insert(key).unwrap();
            heap.payload_mut(node).copy_from_slice(&key.to_ne_bytes());
            *model.entry(key).or_insert(0) += 1;
            live += 1;
        } else {
            let (&expect, _) = model.iter().next().unwrap();
            assert_eq!(heap.find_min(), expect, "find_min diverged at op {op}");
            let node = heap.delete_min().unwrap();
            let tagged = i64::from_ne_bytes(heap.payload(node).try_into().unwrap());
            assert_eq!(tagged, expect, "payload diverged at op {op}");
            let counter = model.get_mut(&expect).unwrap();
            if *counter == 1 {
                model.remove(&expect);
            } else {
                *counter -= 1;
            }
            live -= 1;
        }
    }
    info!("Phase B: final population {live}");
}

/// Timed sessions with random slots and clock advances; sweeps must agree
/// with an expiry model exactly
fn stress_session_sweep(rng: &mut ThreadRng, rounds: usize) {
    logstress!("C [SESSION]", "expiry sweeps against an expiry model");
    let mut session = SessionTable::new(SessionConfig {
        table: TableConfig {
            key_size: 8,
            value_size: 8,
            max_elems: 64,
            max_load_factor: 0.8,
            resizable: true,
        },
    })
    .unwrap();
    let timeouts = [20i64, 100, 500];
    for timeout in timeouts {
        session.add_timeout_slot(timeout, 16, true).unwrap();
    }
    let mut model: HashMap<u64, i64> = HashMap::new();
    let mut clock = 0i64;
    let mut next_key = 0u64;
    for round in 0..rounds {
        clock += rng.gen_range(1..10);
        session.increase_global_time(clock).unwrap();
        for _ in 0..rng.gen_range(1..6) {
            let slot = rng.gen_range(1u8..=3);
            let key = next_key;
            next_key += 1;
            session.insert(&key.to_ne_bytes(), slot).unwrap();
            model.insert(key, clock + timeouts[slot as usize - 1]);
        }
        let due = model.values().filter(|expiry| **expiry <= clock).count();
        let swept = session.next_timeout_entries(usize::MAX);
        assert_eq!(swept.len(), due, "sweep diverged at round {round}");
        let swept: Vec<u64> = swept
            .iter()
            .map(|pair| u64::from_ne_bytes(pair.key.try_into().unwrap()))
            .collect();
        for key in swept {
            assert!(model.remove(&key).is_some(), "unexpected eviction of {key}");
        }
        assert_eq!(session.len(), model.len());
    }
    info!(
        "Phase C: {} sessions still live at clock {clock}",
        session.len()
    );
}
