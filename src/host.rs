/*!
Host-side NMP loop: drives the PIM memory and the commodity memory at their
configured clock ratio, injects one pooling batch group at a time, and funnels
every upward completion through the fixed-latency reduction adder.

Per pooling group (`batch_size` consecutive pools):
1. Profile the transfer vectors: the last eligible q-vector per
   (channel, bank-group) bucket of each pool. Expected upward transfers =
   distinct buckets (PIM mode) or every PIM vector (PIM off), plus every
   commodity-memory vector.
2. Loop until the adder drains: tick both memories per the ratio, inject up
   to `num_ca_in_cycle` PIM transactions (never two into one channel in the
   same tick) and at most one commodity transaction, then step the adder with
   the completions that landed this tick.

Completion bookkeeping is a per-address in-flight count: a completion of
address A decrements exactly one count. Only transfer vectors are tracked on
the PIM side (every vector when PIM is off); the commodity side tracks all.
*/

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info};

use crate::cache::Cache;
use crate::command::PimValues;
use crate::config::Config;
use crate::error::SimError;
use crate::memory_system::MemorySystem;
use crate::pim::NmpAdder;
use crate::trace::{Pool, TraceEntry, TraceOp, VecClass, load_trace_file};

#[derive(Default)]
struct InFlight {
    counts: HashMap<u64, u64>,
    completions: u64,
}

impl InFlight {
    fn track(&mut self, addr: u64) {
        *self.counts.entry(addr).or_insert(0) += 1;
    }

    /// Decrement exactly one in-flight count for `addr`; untracked
    /// completions (plain sub-vector reads) pass through silently.
    fn complete(&mut self, addr: u64) {
        if let Some(count) = self.counts.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&addr);
            }
            self.completions += 1;
        }
    }

    fn take_completions(&mut self) -> u64 {
        std::mem::take(&mut self.completions)
    }
}

/// Book-keeping for one in-flight pooling group.
struct BatchState {
    pim_left: Vec<usize>,
    mem_left: Vec<usize>,
    transfer_addrs: Vec<HashMap<usize, u64>>,
}

#[derive(Clone, Debug, Default)]
pub struct HostSummary {
    pub pim_cycles: u64,
    pub mem_cycles: u64,
    pub groups_processed: usize,
    pub transfers_consumed: u64,
    pub sram_hits: u64,
}

pub struct EmbeddingHost {
    pim_mem: MemorySystem,
    mem: MemorySystem,
    pools: Vec<Pool>,

    batch_size: usize,
    num_ca_in_cycle: usize,
    pim_enabled: bool,
    lut_enabled: bool,
    hot_replication: bool,
    ca_compression: bool,
    pim_ticks_per_period: u64,
    mem_ticks_per_period: u64,
    channels: usize,
    bankgroups: usize,

    clk_pim: u64,
    clk_mem: u64,
    nmp: NmpAdder,
    pim_inflight: Rc<RefCell<InFlight>>,
    mem_inflight: Rc<RefCell<InFlight>>,
    lut_cache: Option<Cache>,
    loads_per_bg: Vec<u64>,
    transfers_consumed: u64,
    sram_hits: u64,
}

impl EmbeddingHost {
    pub fn from_files(
        pim_config_path: &Path,
        mem_config_path: &Path,
        trace_path: &Path,
        output_dir: Option<&Path>,
    ) -> Result<Self, SimError> {
        let pim_config = Config::from_file(pim_config_path)?;
        let mem_config = Config::from_file(mem_config_path)?;
        let pools = load_trace_file(trace_path, pim_config.pim.ca_compression)?;
        Self::new(pim_config, mem_config, pools, output_dir)
    }

    pub fn new(
        pim_config: Rc<Config>,
        mem_config: Rc<Config>,
        pools: Vec<Pool>,
        output_dir: Option<&Path>,
    ) -> Result<Self, SimError> {
        let pim_inflight = Rc::new(RefCell::new(InFlight::default()));
        let mem_inflight = Rc::new(RefCell::new(InFlight::default()));

        let pim_read = {
            let shared = Rc::clone(&pim_inflight);
            Box::new(move |addr: u64| shared.borrow_mut().complete(addr))
        };
        let pim_write = {
            let shared = Rc::clone(&pim_inflight);
            Box::new(move |addr: u64| shared.borrow_mut().complete(addr))
        };
        let mem_read = {
            let shared = Rc::clone(&mem_inflight);
            Box::new(move |addr: u64| shared.borrow_mut().complete(addr))
        };
        let mem_write = {
            let shared = Rc::clone(&mem_inflight);
            Box::new(move |addr: u64| shared.borrow_mut().complete(addr))
        };

        let pim_mem = MemorySystem::new(Rc::clone(&pim_config), output_dir, pim_read, pim_write)?;
        let mem = MemorySystem::new(Rc::clone(&mem_config), None, mem_read, mem_write)?;

        // PIM off means no batching: everything rides tag zero.
        let batch_size = if pim_config.pim.pim_enabled {
            pim_config.pim.batch_size
        } else {
            1
        };
        let lut_cache = if pim_config.sram.sram_enabled {
            Some(Cache::new(
                pim_config.sram.sram_size,
                pim_config.sram.sram_block,
                pim_config.sram.sram_assoc,
            ))
        } else {
            None
        };
        let channels = pim_config.structure.channels;
        let bankgroups = pim_config.structure.bankgroups;

        info!(
            "embedding host: pim={} lut={} ca={} batch_size={} pools={}",
            pim_config.pim.pim_enabled,
            pim_config.pim.lut_enabled,
            pim_config.pim.ca_compression,
            batch_size,
            pools.len()
        );

        Ok(Self {
            pim_mem,
            mem,
            pools,
            batch_size,
            num_ca_in_cycle: pim_config.effective_num_ca_in_cycle(),
            pim_enabled: pim_config.pim.pim_enabled,
            lut_enabled: pim_config.pim.lut_enabled,
            hot_replication: pim_config.pim.hot_replication,
            ca_compression: pim_config.pim.ca_compression,
            pim_ticks_per_period: pim_config.pim.pim_ticks_per_period,
            mem_ticks_per_period: pim_config.pim.mem_ticks_per_period,
            channels,
            bankgroups,
            clk_pim: 0,
            clk_mem: 0,
            nmp: NmpAdder::new(pim_config.pim.add_cycle),
            pim_inflight,
            mem_inflight,
            lut_cache,
            loads_per_bg: vec![0; channels * bankgroups],
            transfers_consumed: 0,
            sram_hits: 0,
        })
    }

    pub fn pim_memory(&self) -> &MemorySystem {
        &self.pim_mem
    }

    pub fn mem_memory(&self) -> &MemorySystem {
        &self.mem
    }

    pub fn clk_pim(&self) -> u64 {
        self.clk_pim
    }

    pub fn clk_mem(&self) -> u64 {
        self.clk_mem
    }

    // ---------------- top-level loop ----------------

    pub fn run(&mut self) -> Result<HostSummary, SimError> {
        let groups = self.pools.len() / self.batch_size;
        for group in 0..groups {
            let batch_start = group * self.batch_size;
            let mut state = self.profile_group(batch_start);
            let total: i64 = self.expected_transfers(batch_start, &state);
            self.nmp.set_total_transfers(total);
            debug!("group {group}: expecting {total} upward transfers");

            let mut batch_tag = 0usize;
            while self.nmp.busy() {
                self.tick()?;
                self.add_batch_transactions(batch_start, &mut batch_tag, &mut state)?;
                let completed = self.pim_inflight.borrow_mut().take_completions()
                    + self.mem_inflight.borrow_mut().take_completions();
                self.transfers_consumed += completed;
                self.nmp.run(completed);
            }
            debug!("group {group} drained at pim clk {}", self.clk_pim);
        }
        Ok(HostSummary {
            pim_cycles: self.clk_pim,
            mem_cycles: self.clk_mem,
            groups_processed: groups,
            transfers_consumed: self.transfers_consumed,
            sram_hits: self.sram_hits,
        })
    }

    /// One host tick: the PIM memory every time, the commodity memory
    /// `mem_ticks_per_period` times every `pim_ticks_per_period` PIM ticks.
    fn tick(&mut self) -> Result<(), SimError> {
        self.pim_mem.clock_tick()?;
        self.clk_pim += 1;
        if self.clk_pim % self.pim_ticks_per_period == 0 {
            for _ in 0..self.mem_ticks_per_period {
                self.mem.clock_tick()?;
                self.clk_mem += 1;
            }
        }
        Ok(())
    }

    // ---------------- group setup ----------------

    fn profile_group(&self, batch_start: usize) -> BatchState {
        let mut state = BatchState {
            pim_left: Vec::with_capacity(self.batch_size),
            mem_left: Vec::with_capacity(self.batch_size),
            transfer_addrs: Vec::with_capacity(self.batch_size),
        };
        for i in 0..self.batch_size {
            let pool = &self.pools[batch_start + i];
            state.pim_left.push(pool.pim.len());
            state.mem_left.push(pool.mem.len());
            state.transfer_addrs.push(self.profile_transfers(pool));
        }
        state
    }

    /// Last eligible vector per (channel, bank-group) bucket. r-vectors are
    /// skipped under LUT (they come from the on-rank cache, never carry the
    /// sum) and hot entries are skipped when replication may move them.
    fn profile_transfers(&self, pool: &Pool) -> HashMap<usize, u64> {
        let mut map = HashMap::new();
        if !self.pim_enabled {
            return map;
        }
        for entry in &pool.pim {
            if entry.op == TraceOp::PrefetchBroadcast {
                continue;
            }
            if self.lut_enabled && entry.vec_class == VecClass::Reference {
                continue;
            }
            if self.hot_replication && entry.vec_class == VecClass::Hot {
                continue;
            }
            map.insert(self.bucket_of(entry.addr), entry.addr);
        }
        map
    }

    fn expected_transfers(&self, batch_start: usize, state: &BatchState) -> i64 {
        let mut total = 0i64;
        for i in 0..self.batch_size {
            let pim_part = if self.pim_enabled {
                state.transfer_addrs[i].len()
            } else {
                // Prefetch broadcasts are fire-and-forget; they never report
                // upward.
                self.pools[batch_start + i]
                    .pim
                    .iter()
                    .filter(|e| e.op != TraceOp::PrefetchBroadcast)
                    .count()
            };
            total += (pim_part + state.mem_left[i]) as i64;
        }
        total
    }

    fn bucket_of(&self, addr: u64) -> usize {
        self.pim_mem.channel_of(addr) * self.bankgroups + self.pim_mem.bankgroup_of(addr)
    }

    // ---------------- injection ----------------

    fn add_batch_transactions(
        &mut self,
        batch_start: usize,
        batch_tag: &mut usize,
        state: &mut BatchState,
    ) -> Result<(), SimError> {
        if *batch_tag >= self.batch_size {
            return Ok(());
        }
        self.add_transactions_to_pim(batch_start, *batch_tag, state)?;
        self.add_transactions_to_mem(batch_start, *batch_tag, state)?;
        if state.pim_left[*batch_tag] == 0 && state.mem_left[*batch_tag] == 0 {
            *batch_tag += 1;
        }
        Ok(())
    }

    fn add_transactions_to_pim(
        &mut self,
        batch_start: usize,
        tag: usize,
        state: &mut BatchState,
    ) -> Result<(), SimError> {
        let pool_idx = batch_start + tag;
        let mut used_channels = vec![false; self.channels];
        let mut injected = 0usize;

        while injected < self.num_ca_in_cycle && state.pim_left[tag] > 0 {
            let total = self.pools[pool_idx].pim.len();
            let entry = self.pools[pool_idx].pim[total - state.pim_left[tag]];

            if entry.op == TraceOp::PrefetchBroadcast {
                if !self.inject_prefetch_broadcast(&entry, tag)? {
                    break;
                }
                state.pim_left[tag] -= 1;
                // A broadcast touches every channel; the tick's budget is
                // spent.
                break;
            }

            let is_r_vec = self.lut_enabled && entry.vec_class == VecClass::Reference;

            // The on-rank cache short-circuits reference vectors entirely.
            if is_r_vec {
                if let Some(cache) = self.lut_cache.as_mut() {
                    if cache.access(entry.addr) {
                        self.sram_hits += 1;
                        state.pim_left[tag] -= 1;
                        continue;
                    }
                }
            }

            let addr = if self.hot_replication && entry.vec_class == VecClass::Hot {
                self.hot_entry_replication(entry.addr)
            } else {
                entry.addr
            };

            let channel = self.pim_mem.channel_of(addr);
            if used_channels[channel] {
                break;
            }
            if !self.pim_mem.will_accept_tagged(addr, false, false, tag) {
                break;
            }

            let bucket = self.bucket_of(addr);
            let vector_transfer = self.pim_enabled
                && !is_r_vec
                && state.transfer_addrs[tag].get(&bucket) == Some(&entry.addr);
            let (num_rds, is_last_subvec, start_addr) = if self.ca_compression {
                (entry.vlen, entry.subvec_idx == entry.vlen - 1, addr)
            } else {
                // Without CA-compression every line is its own one-sub-vector
                // read.
                (1, true, addr)
            };
            let pim_values = PimValues {
                skewed_cycle: 0,
                decode_cycle: 0,
                vector_transfer,
                is_r_vec,
                is_locality_bit: entry.vec_class == VecClass::Hot,
                batch_tag: tag,
                num_rds,
                is_last_subvec,
                start_addr,
            };

            if self.pim_enabled {
                if vector_transfer {
                    self.pim_inflight.borrow_mut().track(addr);
                }
            } else {
                self.pim_inflight.borrow_mut().track(addr);
            }

            self.pim_mem.add_transaction(addr, false, pim_values)?;
            self.loads_per_bg[bucket] += 1;
            state.pim_left[tag] -= 1;
            used_channels[channel] = true;
            injected += 1;
        }
        Ok(())
    }

    /// Synthesize one prefetch per channel from the decoded address. Returns
    /// false (without consuming the entry) when some channel has no room.
    fn inject_prefetch_broadcast(
        &mut self,
        entry: &TraceEntry,
        tag: usize,
    ) -> Result<bool, SimError> {
        let decoded = self.pim_mem.decode(entry.addr);
        let addrs: Vec<u64> = (0..self.channels)
            .map(|ch| {
                let mut a = decoded;
                a.channel = ch;
                self.pim_mem.encode(&a)
            })
            .collect();
        if !addrs
            .iter()
            .all(|&a| self.pim_mem.will_accept_tagged(a, false, true, tag))
        {
            return Ok(false);
        }
        for addr in addrs {
            self.pim_mem.add_prefetch(addr, PimValues::default())?;
        }
        Ok(true)
    }

    fn add_transactions_to_mem(
        &mut self,
        batch_start: usize,
        tag: usize,
        state: &mut BatchState,
    ) -> Result<(), SimError> {
        if state.mem_left[tag] == 0 {
            return Ok(());
        }
        let pool_idx = batch_start + tag;
        let total = self.pools[pool_idx].mem.len();
        let entry = self.pools[pool_idx].mem[total - state.mem_left[tag]];
        if !self.mem.will_accept(entry.addr, false) {
            return Ok(());
        }
        self.mem_inflight.borrow_mut().track(entry.addr);
        self.mem
            .add_transaction(entry.addr, false, PimValues::default())?;
        state.mem_left[tag] -= 1;
        Ok(())
    }

    /// Redirect a hot entry to the currently least-loaded (channel,
    /// bank-group) bucket via the inverse address mapping.
    fn hot_entry_replication(&self, addr: u64) -> u64 {
        let (bucket, _) = self
            .loads_per_bg
            .iter()
            .enumerate()
            .min_by_key(|&(_, load)| *load)
            .expect("at least one bucket");
        let mut decoded = self.pim_mem.decode(addr);
        decoded.channel = bucket / self.bankgroups;
        decoded.bankgroup = bucket % self.bankgroups;
        self.pim_mem.encode(&decoded)
    }

    pub fn write_final_stats(&self, dir: &Path) -> Result<(), SimError> {
        self.pim_mem.write_final_stats(dir)?;
        Ok(())
    }
}
