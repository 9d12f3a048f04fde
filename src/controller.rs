/*!
Per-channel controller: the orchestrator of channel state, refresh engine,
command queue and PIM engine.

Transaction pools:
- `unified_queue` or split `read_queue`/`write_buffer`: accepted but not yet
  promoted to the command queue;
- `pending_rd_q`/`pending_wr_q`: promoted and in flight on DRAM (multimap by
  address; `complete_cycle` stays unset until the data command issues);
- `rvec_queue`: r-vectors bypassing DRAM, waiting out their fixed latency;
- `return_queue`: completions waiting for the DRAM system to pop them.

One `clock_tick` performs, in order: refresh bookkeeping, PIM accumulator
drain, at most one command issue, burst-completion drains through the PIM
ALU, and one transaction promotion. Scheduling prefers reads; a write drain
kicks in at the high watermark and runs down to the low one. Refresh is
opportunistic until its postponement budget runs out, then it starves demand
traffic. Ties are broken FCFS by the command queue.
*/

use std::rc::Rc;

use log::trace;

use crate::channel_state::ChannelState;
use crate::command::{Command, CommandKind, Transaction};
use crate::command_queue::CommandQueue;
use crate::config::{Config, RowBufPolicy};
use crate::error::SimError;
use crate::pim::{AluOutcome, PimEngine};
use crate::refresh::Refresh;
use crate::stats::{self, SimpleStats};
use crate::timing::Timing;

pub struct Controller {
    pub channel_id: usize,
    clk: u64,
    config: Rc<Config>,
    channel_state: ChannelState,
    cmd_queue: CommandQueue,
    refresh: Refresh,
    pim: PimEngine,
    stats: SimpleStats,

    unified_queue: Vec<Transaction>,
    read_queue: Vec<Transaction>,
    write_buffer: Vec<Transaction>,
    pending_rd_q: Vec<Transaction>,
    pending_wr_q: Vec<Transaction>,
    rvec_queue: Vec<Transaction>,
    return_queue: Vec<Transaction>,

    /// Writes left in the current drain burst; zero outside a drain.
    write_draining: usize,
    /// Outstanding prefetch/transfer-class reads (tracked for capacity only).
    prefetch_inflight: usize,
}

impl Controller {
    pub fn new(channel_id: usize, config: Rc<Config>, timing: Rc<Timing>) -> Self {
        Self {
            channel_id,
            clk: 0,
            channel_state: ChannelState::new(Rc::clone(&config), timing),
            cmd_queue: CommandQueue::new(Rc::clone(&config)),
            refresh: Refresh::new(Rc::clone(&config)),
            pim: PimEngine::new(&config),
            stats: SimpleStats::new(),
            unified_queue: Vec::new(),
            read_queue: Vec::new(),
            write_buffer: Vec::new(),
            pending_rd_q: Vec::new(),
            pending_wr_q: Vec::new(),
            rvec_queue: Vec::new(),
            return_queue: Vec::new(),
            write_draining: 0,
            prefetch_inflight: 0,
            config,
        }
    }

    // ---------------- admission ----------------

    /// Capacity check. `batch_tag` narrows the PIM instruction-queue check to
    /// one reduction when the caller knows it.
    pub fn will_accept(
        &self,
        is_write: bool,
        is_pf_or_tr: bool,
        batch_tag: Option<usize>,
    ) -> bool {
        let queue_size = self.config.system.queue_size;
        if is_pf_or_tr {
            // Prefetch/transfer traffic rides a deeper allowance so it cannot
            // be locked out by demand reads.
            return self.prefetch_inflight < 2 * queue_size;
        }
        let trans_queue_ok = if self.config.system.unified_queue {
            self.unified_queue.len() < queue_size
        } else if is_write {
            self.write_buffer.len() < queue_size
        } else {
            self.read_queue.len() < queue_size
        };
        let pending_ok = if is_write {
            self.pending_wr_q.len() < self.config.system.pending_queue_size
        } else {
            self.pending_rd_q.len() < self.config.system.pending_queue_size
        };
        let pim_ok = !self.config.pim.pim_enabled || is_write || {
            match batch_tag {
                Some(tag) => self.pim.will_accept(tag),
                None => (0..self.config.pim.batch_size).all(|tag| self.pim.will_accept(tag)),
            }
        };
        trans_queue_ok && pending_ok && pim_ok
    }

    /// Accept a transaction. Callers must have seen `will_accept` return true
    /// this cycle; violating that contract is fatal.
    pub fn add_transaction(
        &mut self,
        mut trans: Transaction,
        is_pf_or_tr: bool,
    ) -> Result<(), SimError> {
        if !self.will_accept(trans.is_write, is_pf_or_tr, Some(trans.pim.batch_tag)) {
            return Err(SimError::CapacityExceeded {
                addr: trans.hex_addr,
                channel: self.channel_id,
            });
        }
        trans.added_cycle = self.clk;

        if self.config.pim.pim_enabled && !trans.is_write && trans.pim.is_pim() {
            if trans.pim.is_r_vec {
                // Reference vectors never touch DRAM: stamp completions now.
                for sub in self.pim.expand_r_vector(&trans, self.clk) {
                    self.rvec_queue.push(sub);
                }
                return Ok(());
            }
            for sub in self.pim.decompress(&trans, self.clk) {
                self.pim.insert_inst(sub.clone());
                self.push_demand(sub);
            }
            return Ok(());
        }

        if is_pf_or_tr {
            self.prefetch_inflight += 1;
        }
        self.push_demand(trans);
        Ok(())
    }

    fn push_demand(&mut self, trans: Transaction) {
        if self.config.system.unified_queue {
            self.unified_queue.push(trans);
        } else if trans.is_write {
            self.write_buffer.push(trans);
        } else {
            self.read_queue.push(trans);
        }
    }

    pub fn queue_usage(&self) -> usize {
        self.unified_queue.len() + self.read_queue.len() + self.write_buffer.len()
    }

    /// Everything drained: the host uses this for quiescence detection.
    pub fn all_queues_empty(&self) -> bool {
        self.queue_usage() == 0
            && self.pending_rd_q.is_empty()
            && self.pending_wr_q.is_empty()
            && self.rvec_queue.is_empty()
            && self.return_queue.is_empty()
            && self.cmd_queue.is_empty()
            && self.pim.is_idle()
    }

    // ---------------- per-cycle work ----------------

    pub fn clock_tick(&mut self) -> Result<(), SimError> {
        self.refresh.tick(&mut self.channel_state);
        self.pim.tick();

        if let Some(cmd) = self.select_command() {
            self.issue_command(cmd)?;
        }

        self.process_due_reads();
        self.process_due_writes();
        self.process_rvec_queue();
        self.schedule_transaction();

        self.clk += 1;
        Ok(())
    }

    /// Pop the next completion whose clock has been reached.
    pub fn return_done_trans(&mut self, clock: u64) -> Option<Transaction> {
        let pos = self
            .return_queue
            .iter()
            .position(|t| t.is_complete_at(clock))?;
        Some(self.return_queue.remove(pos))
    }

    // ---------------- command selection ----------------

    fn select_command(&mut self) -> Option<Command> {
        // Refresh past its postponement budget preempts demand traffic.
        if self.refresh.escalated() {
            let req = self.refresh.pending_command()?;
            return self.channel_state.get_ready_command(&req, self.clk);
        }

        let demand = {
            let pim = &self.pim;
            let pending = &self.pending_rd_q;
            let gate_enabled = self.config.pim.pim_enabled;
            let clk = self.clk;
            self.cmd_queue
                .get_command(clk, &self.channel_state, |entry| {
                    if !gate_enabled || !entry.kind.is_read() {
                        return true;
                    }
                    match pending
                        .iter()
                        .find(|t| t.hex_addr == entry.hex_addr && t.pim.is_pim())
                    {
                        Some(t) => pim.command_issuable(t, clk),
                        None => true,
                    }
                })
        };
        if demand.is_some() {
            return demand;
        }

        // Opportunistic refresh when the cycle would otherwise idle.
        if let Some(req) = self.refresh.pending_command() {
            if let Some(ready) = self.channel_state.get_ready_command(&req, self.clk) {
                return Some(ready);
            }
        }

        self.maybe_enter_self_refresh()
    }

    fn maybe_enter_self_refresh(&self) -> Option<Command> {
        if !self.config.system.enable_self_refresh || !self.all_queues_empty() {
            return None;
        }
        for rank in 0..self.config.structure.ranks {
            if self.channel_state.rank_in_self_refresh(rank) {
                continue;
            }
            if self.channel_state.rank_idle_cycles(rank, self.clk)
                < self.config.system.sref_idle_window
            {
                continue;
            }
            let enter = Command::new(
                CommandKind::SrefEnter,
                crate::address::Address::new(self.channel_id, rank, 0, 0, 0, 0),
                0,
            );
            if let Some(ready) = self.channel_state.get_ready_command(&enter, self.clk) {
                return Some(ready);
            }
        }
        None
    }

    // ---------------- issue ----------------

    fn issue_command(&mut self, cmd: Command) -> Result<(), SimError> {
        if !self.channel_state.is_ready(&cmd, self.clk) {
            return Err(SimError::IllegalCommandIssue {
                kind: cmd.kind,
                channel: self.channel_id,
                clk: self.clk,
                earliest: self.channel_state.earliest_legal(&cmd),
            });
        }
        trace!(
            "ch {} clk {} issue {:?} @0x{:x}",
            self.channel_id, self.clk, cmd.kind, cmd.hex_addr
        );
        self.stats.command_issued(cmd.kind);
        if cmd.kind.is_read_write() {
            self.record_row_outcome(&cmd);
        }
        self.channel_state.update(&cmd, self.clk);

        match cmd.kind {
            CommandKind::Read | CommandKind::ReadPrecharge => self.bake_read(&cmd),
            CommandKind::Write | CommandKind::WritePrecharge => self.bake_write(&cmd),
            CommandKind::Refresh | CommandKind::RefreshBank => {
                self.refresh.refresh_issued(&cmd, &mut self.channel_state);
            }
            _ => {}
        }
        Ok(())
    }

    fn record_row_outcome(&mut self, cmd: &Command) {
        let bank = self
            .channel_state
            .bank(cmd.addr.rank, cmd.addr.bankgroup, cmd.addr.bank);
        let hit = bank.row_hits() > 0;
        let name = match (cmd.kind.is_write(), hit) {
            (false, true) => stats::NUM_READ_ROW_HITS,
            (false, false) => stats::NUM_READ_ROW_MISSES,
            (true, true) => stats::NUM_WRITE_ROW_HITS,
            (true, false) => stats::NUM_WRITE_ROW_MISSES,
        };
        self.stats.inc(name);
    }

    /// Stamp the completion clock on the oldest unbaked pending read for this
    /// address and, if it is a PIM read, move its instruction in flight.
    fn bake_read(&mut self, cmd: &Command) {
        let read_done = self.clk + self.config.read_delay();
        if let Some(t) = self
            .pending_rd_q
            .iter_mut()
            .find(|t| t.hex_addr == cmd.hex_addr && t.complete_cycle == Transaction::UNSET)
        {
            t.complete_cycle = read_done;
            if self.config.pim.pim_enabled && t.pim.is_pim() {
                let t = t.clone();
                self.pim.mark_issued(&t);
            }
        }
    }

    fn bake_write(&mut self, cmd: &Command) {
        let write_done = self.clk + self.config.write_delay();
        if let Some(t) = self
            .pending_wr_q
            .iter_mut()
            .find(|t| t.hex_addr == cmd.hex_addr && t.complete_cycle == Transaction::UNSET)
        {
            t.complete_cycle = write_done;
        }
    }

    // ---------------- completion paths ----------------

    fn process_due_reads(&mut self) {
        let mut i = 0;
        while i < self.pending_rd_q.len() {
            if !self.pending_rd_q[i].is_complete_at(self.clk) {
                i += 1;
                continue;
            }
            let outcome = {
                let t = &self.pending_rd_q[i];
                if self.config.pim.pim_enabled && t.pim.is_pim() {
                    self.pim.run_alu(t)
                } else {
                    AluOutcome::Complete
                }
            };
            match outcome {
                AluOutcome::Hold => i += 1,
                AluOutcome::Complete => {
                    let mut t = self.pending_rd_q.remove(i);
                    t.complete_cycle = self.clk;
                    self.finish_read(t);
                }
                AluOutcome::Transfer => {
                    let mut t = self.pending_rd_q.remove(i);
                    t.complete_cycle = self.clk;
                    self.stats.inc(stats::NUM_TRANSFERS_DONE);
                    self.finish_read(t);
                }
            }
        }
    }

    fn finish_read(&mut self, t: Transaction) {
        self.stats.inc(stats::NUM_READS_DONE);
        self.stats
            .record_read_latency(t.added_cycle, t.complete_cycle);
        if self.prefetch_inflight > 0 && !t.pim.is_pim() {
            // Conservative: any non-PIM read completion may retire a prefetch.
            self.prefetch_inflight = self.prefetch_inflight.saturating_sub(1);
        }
        self.return_queue.push(t);
    }

    fn process_due_writes(&mut self) {
        let mut i = 0;
        while i < self.pending_wr_q.len() {
            if self.pending_wr_q[i].is_complete_at(self.clk) {
                let t = self.pending_wr_q.remove(i);
                self.stats.inc(stats::NUM_WRITES_DONE);
                self.return_queue.push(t);
            } else {
                i += 1;
            }
        }
    }

    fn process_rvec_queue(&mut self) {
        let mut i = 0;
        while i < self.rvec_queue.len() {
            if !self.rvec_queue[i].is_complete_at(self.clk) {
                i += 1;
                continue;
            }
            let t = self.rvec_queue.remove(i);
            // r-vector rows of the ALU always complete; the last sub-vector
            // charges the accumulator on its way out.
            let _ = self.pim.run_alu(&t);
            self.stats.inc(stats::NUM_READS_DONE);
            self.return_queue.push(t);
        }
    }

    // ---------------- promotion ----------------

    /// Move one transaction from the accept queues into the command queue and
    /// the pending pool.
    fn schedule_transaction(&mut self) {
        let from_writes = self.choose_write_drain();
        let queue: &mut Vec<Transaction> = if self.config.system.unified_queue {
            &mut self.unified_queue
        } else if from_writes {
            &mut self.write_buffer
        } else {
            &mut self.read_queue
        };

        let mut picked = None;
        for (pos, trans) in queue.iter().enumerate() {
            // A write may not bypass a pending read to the same address and
            // vice versa.
            let hazard = if trans.is_write {
                self.pending_rd_q
                    .iter()
                    .any(|t| t.hex_addr == trans.hex_addr)
            } else {
                self.pending_wr_q
                    .iter()
                    .any(|t| t.hex_addr == trans.hex_addr)
            };
            if hazard {
                continue;
            }
            let addr = self.config.address_mapping(trans.hex_addr);
            if !self.cmd_queue.will_accept(&addr) {
                continue;
            }
            picked = Some(pos);
            break;
        }

        let Some(pos) = picked else { return };
        let trans = queue.remove(pos);
        let cmd = self.trans_to_command(&trans);
        self.cmd_queue.add_command(cmd);
        if trans.is_write {
            if self.write_draining > 0 {
                self.write_draining -= 1;
            }
            self.pending_wr_q.push(trans);
        } else {
            self.pending_rd_q.push(trans);
        }
    }

    /// Decide whether this cycle promotes from the write buffer.
    fn choose_write_drain(&mut self) -> bool {
        if self.config.system.unified_queue {
            return false;
        }
        if self.write_draining == 0 {
            let above_high = self.write_buffer.len() >= self.config.system.write_buf_high;
            let reads_idle = self.read_queue.is_empty() && !self.write_buffer.is_empty();
            if above_high {
                // Drain down to the low watermark.
                self.write_draining = self
                    .write_buffer
                    .len()
                    .saturating_sub(self.config.system.write_buf_low);
            } else if reads_idle {
                self.write_draining = self.write_buffer.len();
            }
        }
        self.write_draining > 0 && !self.write_buffer.is_empty()
    }

    fn trans_to_command(&self, trans: &Transaction) -> Command {
        let addr = self.config.address_mapping(trans.hex_addr);
        let kind = match (trans.is_write, self.config.row_buf_policy) {
            (false, RowBufPolicy::OpenPage) => CommandKind::Read,
            (false, RowBufPolicy::ClosePage) => CommandKind::ReadPrecharge,
            (true, RowBufPolicy::OpenPage) => CommandKind::Write,
            (true, RowBufPolicy::ClosePage) => CommandKind::WritePrecharge,
        };
        Command::new(kind, addr, trans.hex_addr)
    }

    // ---------------- stats ----------------

    pub fn stats_mut(&mut self) -> &mut SimpleStats {
        &mut self.stats
    }

    pub fn epoch_json(&mut self) -> serde_json::Value {
        let clk = self.clk;
        self.stats.epoch_json(self.channel_id, clk)
    }

    pub fn final_json(&self) -> serde_json::Value {
        self.stats.final_json(self.clk)
    }

    #[cfg(test)]
    pub(crate) fn clk(&self) -> u64 {
        self.clk
    }
}
