//! Shared test utilities: small topologies, PIM-enabled configs, trace-pool
//! builders and a clonable callback counter.
//!
//! These helpers de-duplicate fixture construction across the bank, queue,
//! controller, system and host test modules. They intentionally support just
//! what the test suite needs: one- and two-channel topologies with a handful
//! of rows, and hand-rolled pooling batches.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use crate::command::{PimValues, Transaction};
use crate::config::{Config, ConfigFile};
use crate::trace::{Pool, Target, TraceEntry, TraceOp, VecClass};

fn config_from(text: &str) -> Config {
    let file: ConfigFile = toml::from_str(text).expect("fixture TOML parses");
    Config::from_parsed(file).expect("fixture config validates")
}

/// One channel, one rank, 4 bank-groups x 2 banks, 512 rows. Queue depth 8
/// and a widened tFAW so the activation window is observable in tests.
pub fn small_config() -> Config {
    config_from(
        r#"
        [dram_structure]
        channels = 1
        ranks = 1
        bankgroups = 4
        banks_per_group = 2
        rows = 512
        columns = 32

        [timing]
        trrd_s = 4
        tfaw = 32

        [system]
        queue_size = 8
        pending_queue_size = 64
        write_buf_high = 6
        write_buf_low = 2
        "#,
    )
}

/// `small_config` with two channels.
pub fn two_channel_config() -> Config {
    config_from(
        r#"
        [dram_structure]
        channels = 2
        ranks = 1
        bankgroups = 4
        banks_per_group = 2
        rows = 512
        columns = 32

        [timing]
        trrd_s = 4
        tfaw = 32

        [system]
        queue_size = 8
        pending_queue_size = 64
        write_buf_high = 6
        write_buf_low = 2
        "#,
    )
}

/// `small_config` plus the PIM datapath: LUT mode on, two concurrent batches.
pub fn pim_config() -> Config {
    config_from(
        r#"
        [dram_structure]
        channels = 1
        ranks = 1
        bankgroups = 4
        banks_per_group = 2
        rows = 512
        columns = 32

        [timing]
        trrd_s = 4
        tfaw = 32

        [system]
        queue_size = 8
        pending_queue_size = 64
        write_buf_high = 6
        write_buf_low = 2

        [pim]
        pim_enabled = true
        lut_enabled = true
        batch_size = 2
        pim_cycle = 4
        decode_cycle = 2
        skewed_cycle = 1
        add_cycle = 3
        "#,
    )
}

/// A single-sub-vector PIM read transaction.
pub fn pim_read(addr: u64, batch_tag: usize, is_r_vec: bool) -> Transaction {
    Transaction::with_pim(
        addr,
        false,
        PimValues {
            is_r_vec,
            batch_tag,
            num_rds: 1,
            is_last_subvec: true,
            start_addr: addr,
            ..Default::default()
        },
    )
}

/// Clonable counter for completion callbacks.
#[derive(Clone, Default)]
pub struct Counter(Rc<Cell<u64>>);

impl Counter {
    pub fn bump(&self) {
        self.0.set(self.0.get() + 1);
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

/// Two handles on the same count: one to move into a callback, one to probe.
pub fn shared_counter() -> (Counter, Counter) {
    let counter = Counter::default();
    (counter.clone(), counter)
}

/// Build pooling batches by hand: `pim[i]` is pool i's HBM side as
/// `(address, vec_class)` pairs, `mem[i]` its DIMM side as addresses.
pub fn host_pools(pim: &[&[(u64, char)]], mem: &[&[u64]]) -> Vec<Pool> {
    assert_eq!(pim.len(), mem.len(), "pool slices must pair up");
    pim.iter()
        .zip(mem.iter())
        .map(|(p, m)| Pool {
            pim: p
                .iter()
                .map(|&(addr, class)| TraceEntry {
                    target: Target::Hbm,
                    op: TraceOp::Read,
                    addr,
                    vec_class: match class {
                        'q' => VecClass::Query,
                        'r' => VecClass::Reference,
                        'h' => VecClass::Hot,
                        _ => VecClass::Other,
                    },
                    subvec_idx: 0,
                    vlen: 1,
                    batch_tag: 0,
                })
                .collect(),
            mem: m
                .iter()
                .map(|&addr| TraceEntry {
                    target: Target::Dimm,
                    op: TraceOp::Read,
                    addr,
                    vec_class: VecClass::Other,
                    subvec_idx: 0,
                    vlen: 1,
                    batch_tag: 0,
                })
                .collect(),
        })
        .collect()
}
