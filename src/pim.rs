/*!
Per-channel PIM instruction engine and the host-side NMP adder stage.

The engine tracks, per batch tag:
- `instruction_queue`: decoded sub-vector reads not yet issued to DRAM;
- `read_queue`: one entry per issued in-flight sub-vector, keyed by its
  address. The running seen-count for a logical vector lives on its
  `start_addr` entry;
- `pim_cycle_left`: remaining accumulation cycles before the pending transfer
  may fire (each completed logical vector deposits `pim_cycle` here);
- `transfer_in_progress`: guard so the transfer candidate charges the
  accumulator exactly once and subsequent candidates wait their turn.

`run_alu` is the completion decision table: a finished sub-vector read either
completes locally (plain q sub-vector or r-vector), is held (its siblings or
the accumulator are still outstanding), or emits the aggregated transfer
upward. The controller re-runs held transactions every cycle.

Decompression lives here too: a logical vector at `addr` with `num_rds`
sub-vectors becomes reads at `addr, addr-64, ..`; the one at `addr` carries
`is_last_subvec` (and, alone, the transfer flag).
*/

use crate::command::Transaction;
use crate::config::Config;

/// Byte stride between adjacent sub-vectors.
const SUBVEC_BYTES: u64 = 64;

/// Outcome of the completion ALU for one finished sub-vector read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluOutcome {
    /// Completion is visible upward as a plain read.
    Complete,
    /// Nothing visible yet; retry next cycle.
    Hold,
    /// Emit the aggregated transfer completion upward.
    Transfer,
}

#[derive(Clone, Debug)]
struct ReadEntry {
    addr: u64,
    seen: u32,
    vector_transfer: bool,
}

pub struct PimEngine {
    instruction_queue: Vec<Vec<Transaction>>,
    read_queue: Vec<Vec<ReadEntry>>,
    pim_cycle_left: Vec<u64>,
    transfer_in_progress: Vec<bool>,
    pim_cycle: u64,
    decode_cycle: u64,
    skewed_cycle: u64,
    batch_size: usize,
    inst_queue_cap: usize,
}

impl PimEngine {
    pub fn new(config: &Config) -> Self {
        let batch_size = config.pim.batch_size;
        Self {
            instruction_queue: vec![Vec::new(); batch_size],
            read_queue: vec![Vec::new(); batch_size],
            pim_cycle_left: vec![0; batch_size],
            transfer_in_progress: vec![false; batch_size],
            pim_cycle: config.pim.pim_cycle,
            decode_cycle: config.pim.decode_cycle,
            skewed_cycle: config.pim.skewed_cycle,
            batch_size,
            inst_queue_cap: config.system.queue_size,
        }
    }

    /// Drain one accumulation cycle per batch.
    pub fn tick(&mut self) {
        for left in self.pim_cycle_left.iter_mut() {
            if *left > 0 {
                *left -= 1;
            }
        }
    }

    // ---------------- decode / insert ----------------

    /// Expand a q-vector transaction into its sub-vector reads, stamping the
    /// decode and skew offsets relative to `clk`.
    pub fn decompress(&self, trans: &Transaction, clk: u64) -> Vec<Transaction> {
        let num_rds = trans.pim.num_rds.max(1);
        (0..num_rds as u64)
            .map(|k| {
                let mut sub = trans.clone();
                sub.hex_addr = trans.hex_addr - k * SUBVEC_BYTES;
                sub.pim.start_addr = trans.hex_addr;
                sub.pim.num_rds = num_rds;
                sub.pim.is_last_subvec = k == 0;
                sub.pim.vector_transfer = trans.pim.vector_transfer && k == 0;
                sub.pim.skewed_cycle = clk + self.skewed_cycle;
                sub.pim.decode_cycle = clk + self.decode_cycle;
                sub
            })
            .collect()
    }

    /// Expand an r-vector: sub-vectors bypass DRAM and complete at
    /// `clk + (k + 1)`.
    pub fn expand_r_vector(&self, trans: &Transaction, clk: u64) -> Vec<Transaction> {
        let num_rds = trans.pim.num_rds.max(1);
        (0..num_rds as u64)
            .map(|k| {
                let mut sub = trans.clone();
                sub.hex_addr = trans.hex_addr - k * SUBVEC_BYTES;
                sub.pim.start_addr = trans.hex_addr;
                sub.pim.num_rds = num_rds;
                sub.pim.is_last_subvec = k == 0;
                sub.pim.vector_transfer = trans.pim.vector_transfer && k == 0;
                sub.complete_cycle = clk + k + 1;
                sub
            })
            .collect()
    }

    pub fn insert_inst(&mut self, trans: Transaction) {
        debug_assert!(trans.pim.batch_tag < self.batch_size);
        self.instruction_queue[trans.pim.batch_tag].push(trans);
    }

    /// Backpressure hook: room left in the batch's instruction queue.
    pub fn will_accept(&self, batch_tag: usize) -> bool {
        self.instruction_queue[batch_tag].len() < self.inst_queue_cap
    }

    pub fn addr_in_instruction_queue(&self, trans: &Transaction) -> bool {
        self.instruction_queue[trans.pim.batch_tag]
            .iter()
            .any(|t| t.hex_addr == trans.hex_addr)
    }

    // ---------------- issue gating ----------------

    /// True when a DRAM read for `trans` may go out: the instruction is still
    /// buffered and both its decode and skew clocks have passed.
    pub fn command_issuable(&self, trans: &Transaction, clk: u64) -> bool {
        self.instruction_queue[trans.pim.batch_tag].iter().any(|t| {
            t.hex_addr == trans.hex_addr && t.pim.skewed_cycle.max(t.pim.decode_cycle) <= clk
        })
    }

    /// The READ went out: move the instruction to the in-flight read queue.
    /// Sibling completions may have opened the entry early to park their
    /// counts, so merge instead of duplicating.
    pub fn mark_issued(&mut self, trans: &Transaction) {
        let tag = trans.pim.batch_tag;
        let queue = &mut self.instruction_queue[tag];
        if let Some(pos) = queue.iter().position(|t| t.hex_addr == trans.hex_addr) {
            let inst = queue.remove(pos);
            match self.read_queue[tag]
                .iter_mut()
                .find(|e| e.addr == inst.hex_addr)
            {
                Some(entry) => entry.vector_transfer |= inst.pim.vector_transfer,
                None => self.read_queue[tag].push(ReadEntry {
                    addr: inst.hex_addr,
                    seen: 0,
                    vector_transfer: inst.pim.vector_transfer,
                }),
            }
        }
    }

    // ---------------- completion ALU ----------------

    pub fn run_alu(&mut self, done: &Transaction) -> AluOutcome {
        if self.is_transfer_trans(done) {
            if !self.all_subvec_reads_complete(done) {
                return AluOutcome::Hold;
            }
            if !self.last_addition_in_progress(done) {
                self.add_pim_cycle(done);
                return AluOutcome::Hold;
            }
            if self.pim_cycle_complete(done) {
                self.last_addition_complete(done);
                self.erase_from_read_queue(done);
                return AluOutcome::Transfer;
            }
            AluOutcome::Hold
        } else if done.pim.is_last_subvec {
            if done.pim.is_r_vec {
                self.add_pim_cycle(done);
                AluOutcome::Complete
            } else if self.all_subvec_reads_complete(done) {
                self.add_pim_cycle(done);
                self.erase_from_read_queue(done);
                AluOutcome::Complete
            } else {
                AluOutcome::Hold
            }
        } else if done.pim.is_r_vec {
            AluOutcome::Complete
        } else {
            self.increment_subvec_count(done);
            self.erase_from_read_queue(done);
            AluOutcome::Complete
        }
    }

    /// Both transfer checks ORed: the transaction's own flag, or an in-flight
    /// read-queue entry for the same address carrying the flag.
    fn is_transfer_trans(&self, trans: &Transaction) -> bool {
        trans.pim.vector_transfer
            || self.read_queue[trans.pim.batch_tag]
                .iter()
                .any(|e| e.addr == trans.hex_addr && e.vector_transfer)
    }

    fn all_subvec_reads_complete(&self, trans: &Transaction) -> bool {
        self.read_queue[trans.pim.batch_tag]
            .iter()
            .any(|e| e.addr == trans.hex_addr && e.seen == trans.pim.num_rds - 1)
    }

    fn increment_subvec_count(&mut self, trans: &Transaction) {
        let queue = &mut self.read_queue[trans.pim.batch_tag];
        match queue.iter_mut().find(|e| e.addr == trans.pim.start_addr) {
            Some(entry) => entry.seen += 1,
            // The logical vector's own read has not issued yet; open the
            // entry early so the count is not lost.
            None => queue.push(ReadEntry {
                addr: trans.pim.start_addr,
                seen: 1,
                vector_transfer: false,
            }),
        }
    }

    fn erase_from_read_queue(&mut self, trans: &Transaction) {
        let queue = &mut self.read_queue[trans.pim.batch_tag];
        if let Some(pos) = queue.iter().position(|e| e.addr == trans.hex_addr) {
            queue.remove(pos);
        }
    }

    fn add_pim_cycle(&mut self, trans: &Transaction) {
        self.pim_cycle_left[trans.pim.batch_tag] += self.pim_cycle;
    }

    fn pim_cycle_complete(&self, trans: &Transaction) -> bool {
        self.pim_cycle_left[trans.pim.batch_tag] == 0
    }

    /// First completion of the transfer candidate charges the accumulator and
    /// flips the guard; later calls see it set.
    fn last_addition_in_progress(&mut self, trans: &Transaction) -> bool {
        let flag = &mut self.transfer_in_progress[trans.pim.batch_tag];
        if !*flag {
            *flag = true;
            return false;
        }
        true
    }

    fn last_addition_complete(&mut self, trans: &Transaction) {
        self.transfer_in_progress[trans.pim.batch_tag] = false;
    }

    // ---------------- introspection ----------------

    pub fn pim_cycle_left(&self, batch_tag: usize) -> u64 {
        self.pim_cycle_left[batch_tag]
    }

    pub fn transfer_in_progress(&self, batch_tag: usize) -> bool {
        self.transfer_in_progress[batch_tag]
    }

    pub fn inflight_reads(&self, batch_tag: usize) -> usize {
        self.read_queue[batch_tag].len()
    }

    pub fn is_idle(&self) -> bool {
        self.instruction_queue.iter().all(Vec::is_empty)
            && self.read_queue.iter().all(Vec::is_empty)
    }
}

// ---------------- host-side reduction adder ----------------

/// Fixed-latency reduction stage behind a FIFO. Every upward completion lands
/// in the FIFO; the stage consumes one element per `add_cycle` cycles.
pub struct NmpAdder {
    add_cycle: u64,
    cycle_left: u64,
    buffered: u64,
    total_transfers: i64,
}

impl NmpAdder {
    pub fn new(add_cycle: u64) -> Self {
        Self {
            add_cycle,
            cycle_left: 0,
            buffered: 0,
            total_transfers: 0,
        }
    }

    pub fn set_total_transfers(&mut self, transfers: i64) {
        self.total_transfers = transfers;
    }

    pub fn pending_transfers(&self) -> i64 {
        self.total_transfers
    }

    /// True while anything is still expected, buffered, or mid-addition.
    pub fn busy(&self) -> bool {
        self.total_transfers > 0 || self.buffered > 0 || self.cycle_left > 0
    }

    /// One tick of the adder: drain the pipeline stage, then absorb this
    /// cycle's arrivals. Returns true when any arrival was consumed.
    pub fn run(&mut self, arrived: u64) -> bool {
        if self.cycle_left > 0 {
            self.cycle_left -= 1;
        } else if self.buffered > 0 {
            self.buffered -= 1;
            self.cycle_left = self.add_cycle;
        }

        if arrived == 0 {
            return false;
        }
        if self.cycle_left > 0 {
            self.buffered += arrived;
        } else {
            self.cycle_left = self.add_cycle;
            self.buffered += arrived - 1;
        }
        self.total_transfers -= arrived as i64;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{pim_config, pim_read};

    fn engine() -> PimEngine {
        PimEngine::new(&pim_config())
    }

    #[test]
    fn decompress_descends_by_64_bytes() {
        let eng = engine();
        let mut trans = pim_read(0x1000, 0, false);
        trans.pim.num_rds = 4;
        trans.pim.vector_transfer = true;
        let subs = eng.decompress(&trans, 100);
        let addrs: Vec<u64> = subs.iter().map(|s| s.hex_addr).collect();
        assert_eq!(addrs, vec![0x1000, 0x0fc0, 0x0f80, 0x0f40]);
        assert!(subs[0].pim.is_last_subvec);
        assert!(subs[0].pim.vector_transfer);
        assert!(subs[1..].iter().all(|s| !s.pim.is_last_subvec));
        assert!(subs[1..].iter().all(|s| !s.pim.vector_transfer));
        assert!(subs.iter().all(|s| s.pim.start_addr == 0x1000));
        assert!(
            subs.iter()
                .all(|s| s.pim.skewed_cycle == 100 + eng.skewed_cycle
                    && s.pim.decode_cycle == 100 + eng.decode_cycle)
        );
    }

    #[test]
    fn r_vector_stamps_staggered_completions() {
        let eng = engine();
        let mut trans = pim_read(0x2000, 1, true);
        trans.pim.num_rds = 2;
        let subs = eng.expand_r_vector(&trans, 50);
        assert_eq!(subs[0].complete_cycle, 51);
        assert_eq!(subs[1].complete_cycle, 52);
    }

    #[test]
    fn issue_gating_waits_for_decode_and_skew() {
        let mut eng = engine();
        let trans = pim_read(0x1000, 0, false);
        for sub in eng.decompress(&trans, 10) {
            eng.insert_inst(sub);
        }
        let probe = {
            let mut t = pim_read(0x1000, 0, false);
            t.pim.num_rds = 1;
            t
        };
        let gate = 10 + eng.skewed_cycle.max(eng.decode_cycle);
        assert!(!eng.command_issuable(&probe, gate - 1));
        assert!(eng.command_issuable(&probe, gate));

        eng.mark_issued(&probe);
        assert!(!eng.addr_in_instruction_queue(&probe));
        assert_eq!(eng.inflight_reads(0), 1);
    }

    #[test]
    fn single_subvec_transfer_waits_out_pim_cycle() {
        let mut eng = engine();
        let mut trans = pim_read(0x1000, 0, false);
        trans.pim.vector_transfer = true;
        let subs = eng.decompress(&trans, 0);
        for sub in &subs {
            eng.insert_inst(sub.clone());
        }
        eng.mark_issued(&subs[0]);

        // First completion charges the accumulator and holds.
        assert_eq!(eng.run_alu(&subs[0]), AluOutcome::Hold);
        assert!(eng.transfer_in_progress(0));
        assert_eq!(eng.pim_cycle_left(0), eng.pim_cycle);

        // Retries hold until the accumulator drains, then transfer.
        for _ in 0..eng.pim_cycle {
            assert_eq!(eng.run_alu(&subs[0]), AluOutcome::Hold);
            eng.tick();
        }
        assert_eq!(eng.run_alu(&subs[0]), AluOutcome::Transfer);
        assert!(!eng.transfer_in_progress(0));
        assert_eq!(eng.inflight_reads(0), 0);
    }

    #[test]
    fn four_subvec_vector_counts_then_completes() {
        let mut eng = engine();
        let mut trans = pim_read(0x1000, 0, false);
        trans.pim.num_rds = 4;
        let subs = eng.decompress(&trans, 0);
        for sub in &subs {
            eng.insert_inst(sub.clone());
            eng.mark_issued(sub);
        }
        assert_eq!(eng.inflight_reads(0), 4);

        // Last sub-vector finishing early holds until the others arrive.
        assert_eq!(eng.run_alu(&subs[0]), AluOutcome::Hold);
        for sub in &subs[1..] {
            assert_eq!(eng.run_alu(sub), AluOutcome::Complete);
        }
        // All siblings seen: the last sub-vector now completes the vector.
        assert_eq!(eng.run_alu(&subs[0]), AluOutcome::Complete);
        assert_eq!(eng.pim_cycle_left(0), eng.pim_cycle);
        assert_eq!(eng.inflight_reads(0), 0);
    }

    #[test]
    fn r_vector_finalize_adds_pim_cycle() {
        let mut eng = engine();
        let mut trans = pim_read(0x3000, 0, true);
        trans.pim.num_rds = 2;
        let subs = eng.expand_r_vector(&trans, 0);
        // Non-last r sub-vector completes with no accumulator charge.
        assert_eq!(eng.run_alu(&subs[1]), AluOutcome::Complete);
        assert_eq!(eng.pim_cycle_left(0), 0);
        // Last r sub-vector finalizes and charges.
        assert_eq!(eng.run_alu(&subs[0]), AluOutcome::Complete);
        assert_eq!(eng.pim_cycle_left(0), eng.pim_cycle);
    }

    #[test]
    fn batches_accumulate_independently() {
        let mut eng = engine();
        for tag in 0..2 {
            let mut trans = pim_read(0x1000 + 0x40 * tag as u64, tag, false);
            trans.pim.vector_transfer = true;
            let subs = eng.decompress(&trans, 0);
            for sub in &subs {
                eng.insert_inst(sub.clone());
                eng.mark_issued(sub);
            }
            assert_eq!(eng.run_alu(&subs[0]), AluOutcome::Hold);
        }
        assert!(eng.transfer_in_progress(0));
        assert!(eng.transfer_in_progress(1));
        assert_eq!(eng.pim_cycle_left(0), eng.pim_cycle);
        assert_eq!(eng.pim_cycle_left(1), eng.pim_cycle);
    }

    #[test]
    fn adder_pipeline_consumes_one_per_add_cycle() {
        let mut nmp = NmpAdder::new(3);
        nmp.set_total_transfers(3);
        assert!(nmp.busy());

        // Three arrivals in one cycle: one enters the stage, two buffer.
        assert!(nmp.run(3));
        assert_eq!(nmp.pending_transfers(), 0);
        assert!(nmp.busy());

        // Drains in add_cycle steps; idle after the last one clears.
        let mut cycles = 0;
        while nmp.busy() {
            nmp.run(0);
            cycles += 1;
            assert!(cycles < 100, "adder must drain");
        }
        assert_eq!(nmp.pending_transfers(), 0);
    }
}
