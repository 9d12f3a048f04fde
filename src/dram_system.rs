/*!
Channel fan-out and completion dispatch.

Owns one controller per channel, routes transactions by the channel bits of
the address, and drives every controller forward. `clock_tick` advances the
system by `mega_tick` cycles: completions are drained first with a
`clk + mega_tick - 1` look-ahead (so a batched tick does not delay callbacks
by a whole batch), then each controller runs `mega_tick` plain ticks. The
read/write completion callbacks are function values handed over at
construction; each originating transaction fires its callback exactly once.

Epoch statistics are appended as JSON lines; the final report is one outer
object wrapping per-channel objects.
*/

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use log::debug;

use crate::command::{PimValues, Transaction};
use crate::config::Config;
use crate::controller::Controller;
use crate::error::SimError;
use crate::timing::Timing;

pub type CompletionCallback = Box<dyn FnMut(u64)>;

pub struct DramSystem {
    config: Rc<Config>,
    ctrls: Vec<Controller>,
    read_callback: CompletionCallback,
    write_callback: CompletionCallback,
    clk: u64,
    /// Channel count of this instance (a field, not process-wide state).
    total_channels: usize,
    epoch_path: Option<PathBuf>,
}

impl DramSystem {
    pub fn new(
        config: Rc<Config>,
        output_dir: Option<&std::path::Path>,
        read_callback: CompletionCallback,
        write_callback: CompletionCallback,
    ) -> Result<Self, SimError> {
        let timing = Rc::new(Timing::new(&config));
        let total_channels = config.structure.channels;
        let ctrls = (0..total_channels)
            .map(|ch| Controller::new(ch, Rc::clone(&config), Rc::clone(&timing)))
            .collect();
        let epoch_path = match output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}_epoch.json", config.system.output_prefix));
                // Truncate any stale file from a previous run.
                File::create(&path)?;
                Some(path)
            }
            None => None,
        };
        Ok(Self {
            config,
            ctrls,
            read_callback,
            write_callback,
            clk: 0,
            total_channels,
            epoch_path,
        })
    }

    pub fn total_channels(&self) -> usize {
        self.total_channels
    }

    pub fn clk(&self) -> u64 {
        self.clk
    }

    pub fn channel_of(&self, hex_addr: u64) -> usize {
        self.config.channel_of(hex_addr)
    }

    pub fn will_accept(&self, hex_addr: u64, is_write: bool) -> bool {
        self.ctrls[self.channel_of(hex_addr)].will_accept(is_write, false, None)
    }

    pub fn will_accept_tagged(
        &self,
        hex_addr: u64,
        is_write: bool,
        is_pf_or_tr: bool,
        batch_tag: usize,
    ) -> bool {
        self.ctrls[self.channel_of(hex_addr)].will_accept(is_write, is_pf_or_tr, Some(batch_tag))
    }

    pub fn add_transaction(
        &mut self,
        hex_addr: u64,
        is_write: bool,
        pim_values: PimValues,
    ) -> Result<(), SimError> {
        let channel = self.channel_of(hex_addr);
        let trans = Transaction::with_pim(hex_addr, is_write, pim_values);
        self.ctrls[channel].add_transaction(trans, false)
    }

    /// Prefetch/transfer-class insert: capacity comes from the dedicated
    /// allowance instead of the demand queues.
    pub fn add_prefetch(&mut self, hex_addr: u64, pim_values: PimValues) -> Result<(), SimError> {
        let channel = self.channel_of(hex_addr);
        let trans = Transaction::with_pim(hex_addr, false, pim_values);
        self.ctrls[channel].add_transaction(trans, true)
    }

    /// Advance the whole system by one mega-tick.
    pub fn clock_tick(&mut self) -> Result<(), SimError> {
        let look_ahead = self.clk + self.config.system.mega_tick - 1;
        for ctrl in self.ctrls.iter_mut() {
            while let Some(done) = ctrl.return_done_trans(look_ahead) {
                if done.is_write {
                    (self.write_callback)(done.hex_addr);
                } else {
                    (self.read_callback)(done.hex_addr);
                }
            }
        }
        for ctrl in self.ctrls.iter_mut() {
            for _ in 0..self.config.system.mega_tick {
                ctrl.clock_tick()?;
            }
        }
        self.clk += self.config.system.mega_tick;

        if self.clk % self.config.system.epoch_period == 0 {
            self.write_epoch()?;
        }
        Ok(())
    }

    pub fn all_queues_empty(&self) -> bool {
        self.ctrls.iter().all(Controller::all_queues_empty)
    }

    fn write_epoch(&mut self) -> Result<(), SimError> {
        let Some(path) = self.epoch_path.clone() else {
            return Ok(());
        };
        let mut file = OpenOptions::new().append(true).open(&path)?;
        for ctrl in self.ctrls.iter_mut() {
            let snapshot = ctrl.epoch_json();
            writeln!(file, "{snapshot}")?;
        }
        debug!("epoch stats appended at clk {}", self.clk);
        Ok(())
    }

    /// Write the final report: `{"channel_0": {..}, "channel_1": {..}, ..}`.
    pub fn write_final_stats(&self, dir: &std::path::Path) -> Result<PathBuf, SimError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.config.system.output_prefix));
        let report = self.final_json();
        std::fs::write(&path, serde_json::to_string_pretty(&report)?.as_bytes())?;
        Ok(path)
    }

    pub fn final_json(&self) -> serde_json::Value {
        let mut outer = serde_json::Map::new();
        for ctrl in &self.ctrls {
            outer.insert(format!("channel_{}", ctrl.channel_id), ctrl.final_json());
        }
        serde_json::Value::Object(outer)
    }
}
