/*!
Host-facing facade over one DRAM system.

The host loop holds one `MemorySystem` per memory (the PIM-capable part and
the commodity part), each built from its own config file with its own pair of
completion callbacks. The facade keeps a handle on the validated config so
the host can interrogate the topology (channel/bank-group extraction,
clock period) without re-parsing anything.
*/

use std::path::Path;
use std::rc::Rc;

use crate::address::Address;
use crate::command::PimValues;
use crate::config::Config;
use crate::dram_system::{CompletionCallback, DramSystem};
use crate::error::SimError;

pub struct MemorySystem {
    config: Rc<Config>,
    dram: DramSystem,
}

impl MemorySystem {
    pub fn new(
        config: Rc<Config>,
        output_dir: Option<&Path>,
        read_callback: CompletionCallback,
        write_callback: CompletionCallback,
    ) -> Result<Self, SimError> {
        let dram = DramSystem::new(Rc::clone(&config), output_dir, read_callback, write_callback)?;
        Ok(Self { config, dram })
    }

    pub fn from_config_file(
        path: &Path,
        output_dir: Option<&Path>,
        read_callback: CompletionCallback,
        write_callback: CompletionCallback,
    ) -> Result<Self, SimError> {
        let config = Config::from_file(path)?;
        Self::new(config, output_dir, read_callback, write_callback)
    }

    pub fn config(&self) -> &Rc<Config> {
        &self.config
    }

    pub fn tck(&self) -> f64 {
        self.config.timing.tck
    }

    pub fn clk(&self) -> u64 {
        self.dram.clk()
    }

    pub fn clock_tick(&mut self) -> Result<(), SimError> {
        self.dram.clock_tick()
    }

    pub fn will_accept(&self, hex_addr: u64, is_write: bool) -> bool {
        self.dram.will_accept(hex_addr, is_write)
    }

    pub fn will_accept_tagged(
        &self,
        hex_addr: u64,
        is_write: bool,
        is_pf_or_tr: bool,
        batch_tag: usize,
    ) -> bool {
        self.dram
            .will_accept_tagged(hex_addr, is_write, is_pf_or_tr, batch_tag)
    }

    pub fn add_transaction(
        &mut self,
        hex_addr: u64,
        is_write: bool,
        pim_values: PimValues,
    ) -> Result<(), SimError> {
        self.dram.add_transaction(hex_addr, is_write, pim_values)
    }

    pub fn add_prefetch(&mut self, hex_addr: u64, pim_values: PimValues) -> Result<(), SimError> {
        self.dram.add_prefetch(hex_addr, pim_values)
    }

    pub fn all_queues_empty(&self) -> bool {
        self.dram.all_queues_empty()
    }

    pub fn channel_of(&self, hex_addr: u64) -> usize {
        self.config.channel_of(hex_addr)
    }

    pub fn bankgroup_of(&self, hex_addr: u64) -> usize {
        self.config.address_mapping(hex_addr).bankgroup
    }

    pub fn decode(&self, hex_addr: u64) -> Address {
        self.config.address_mapping(hex_addr)
    }

    pub fn encode(&self, addr: &Address) -> u64 {
        self.config.generate_address(addr)
    }

    pub fn write_final_stats(&self, dir: &Path) -> Result<std::path::PathBuf, SimError> {
        self.dram.write_final_stats(dir)
    }

    pub fn final_json(&self) -> serde_json::Value {
        self.dram.final_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{shared_counter, small_config};

    #[test]
    fn facade_round_trips_a_read() {
        let (reads, probe) = shared_counter();
        let mut mem = MemorySystem::new(
            Rc::new(small_config()),
            None,
            Box::new(move |_| reads.bump()),
            Box::new(|_| {}),
        )
        .unwrap();
        assert!(mem.will_accept(0x1000, false));
        mem.add_transaction(0x1000, false, PimValues::default())
            .unwrap();
        for _ in 0..300 {
            mem.clock_tick().unwrap();
        }
        assert_eq!(probe.get(), 1);
        assert!(mem.all_queues_empty());
    }

    #[test]
    fn decode_encode_round_trip() {
        let mem = MemorySystem::new(
            Rc::new(small_config()),
            None,
            Box::new(|_| {}),
            Box::new(|_| {}),
        )
        .unwrap();
        let addr = mem.decode(0x4_3940);
        assert_eq!(mem.encode(&addr), 0x4_3940);
    }
}
