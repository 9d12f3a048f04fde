/*!
Per-bank (or per-bankgroup) command FIFOs with row-buffer policy hooks.

`add_command` is an O(1) append to the target queue. `get_command` scans the
queues in a fair rotation; within a queue it walks entries in age order and
asks the channel state what each entry needs first (ACT, PRE, or the command
itself). The first legal step wins. Two guards keep the scan honest:

- same-address entries never bypass an older same-address entry (read/write
  ordering per bank);
- a row-conflict PRECHARGE is suppressed while another entry in the queue
  still wants the currently open row (row-hit preservation under OPEN_PAGE).

A caller-supplied gate filters demand commands; the controller uses it to
hold PIM reads until the PIM engine says the instruction is issuable.
*/

use std::collections::VecDeque;
use std::rc::Rc;

use crate::address::Address;
use crate::channel_state::ChannelState;
use crate::command::{Command, CommandKind};
use crate::config::{Config, QueueStructure};

pub struct CommandQueue {
    config: Rc<Config>,
    queues: Vec<VecDeque<Command>>,
    next_queue: usize,
}

impl CommandQueue {
    pub fn new(config: Rc<Config>) -> Self {
        let num = match config.queue_structure {
            QueueStructure::PerBank => {
                config.structure.ranks * config.structure.bankgroups
                    * config.structure.banks_per_group
            }
            QueueStructure::PerBankGroup => {
                config.structure.ranks * config.structure.bankgroups
            }
        };
        Self {
            config,
            queues: vec![VecDeque::new(); num],
            next_queue: 0,
        }
    }

    fn queue_index(&self, addr: &Address) -> usize {
        match self.config.queue_structure {
            QueueStructure::PerBank => {
                (addr.rank * self.config.structure.bankgroups + addr.bankgroup)
                    * self.config.structure.banks_per_group
                    + addr.bank
            }
            QueueStructure::PerBankGroup => {
                addr.rank * self.config.structure.bankgroups + addr.bankgroup
            }
        }
    }

    pub fn will_accept(&self, addr: &Address) -> bool {
        self.queues[self.queue_index(addr)].len() < self.config.system.queue_size
    }

    pub fn add_command(&mut self, cmd: Command) -> bool {
        let idx = self.queue_index(&cmd.addr);
        if self.queues[idx].len() >= self.config.system.queue_size {
            return false;
        }
        self.queues[idx].push_back(cmd);
        true
    }

    pub fn queue_usage(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Pick the command to issue this cycle, if any. `demand_gate` is
    /// consulted before a READ/WRITE (not its ACT/PRE prep) is released;
    /// returning false keeps the entry queued.
    pub fn get_command(
        &mut self,
        clk: u64,
        channel_state: &ChannelState,
        mut demand_gate: impl FnMut(&Command) -> bool,
    ) -> Option<Command> {
        let num = self.queues.len();
        for offset in 0..num {
            let qi = (self.next_queue + offset) % num;
            if let Some((entry_pos, ready)) =
                self.scan_queue(qi, clk, channel_state, &mut demand_gate)
            {
                if ready.kind.is_read_write() {
                    self.queues[qi].remove(entry_pos);
                }
                self.next_queue = (qi + 1) % num;
                return Some(ready);
            }
        }
        None
    }

    fn scan_queue(
        &self,
        qi: usize,
        clk: u64,
        channel_state: &ChannelState,
        demand_gate: &mut impl FnMut(&Command) -> bool,
    ) -> Option<(usize, Command)> {
        let queue = &self.queues[qi];
        for (pos, entry) in queue.iter().enumerate() {
            // Never bypass an older entry to the same address.
            if queue
                .iter()
                .take(pos)
                .any(|older| older.hex_addr == entry.hex_addr)
            {
                continue;
            }
            let Some(ready) = channel_state.get_ready_command(entry, clk) else {
                continue;
            };
            if ready.kind == CommandKind::Precharge
                && self.evicts_wanted_row(queue, entry, channel_state)
            {
                continue;
            }
            if ready.kind.is_read_write() && !demand_gate(entry) {
                continue;
            }
            return Some((pos, ready));
        }
        None
    }

    /// True when precharging for `entry` would close a row some other queued
    /// entry still hits.
    fn evicts_wanted_row(
        &self,
        queue: &VecDeque<Command>,
        entry: &Command,
        channel_state: &ChannelState,
    ) -> bool {
        let bank = channel_state.bank(entry.addr.rank, entry.addr.bankgroup, entry.addr.bank);
        let Some(open_row) = bank.open_row() else {
            return false;
        };
        queue.iter().any(|other| {
            other.addr.rank == entry.addr.rank
                && other.addr.bankgroup == entry.addr.bankgroup
                && other.addr.bank == entry.addr.bank
                && other.addr.row == open_row
        })
    }
}
