/*!
Per-channel counters and JSON reporting.

Counters live in an ordered name -> value map so the JSON output is stable.
`epoch_json` reports the delta since the previous epoch snapshot (plus the
epoch ordinal and clock); `final_json` reports cumulative totals with derived
rates (row-hit ratio, average read latency) folded in.
*/

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::command::CommandKind;

#[derive(Clone, Debug, Default)]
pub struct SimpleStats {
    counters: BTreeMap<&'static str, u64>,
    epoch_snapshot: BTreeMap<&'static str, u64>,
    epoch_count: u64,
    read_latency_sum: u64,
    read_latency_count: u64,
}

pub const NUM_READS_DONE: &str = "num_reads_done";
pub const NUM_WRITES_DONE: &str = "num_writes_done";
pub const NUM_TRANSFERS_DONE: &str = "num_transfers_done";
pub const NUM_READ_ROW_HITS: &str = "num_read_row_hits";
pub const NUM_READ_ROW_MISSES: &str = "num_read_row_misses";
pub const NUM_WRITE_ROW_HITS: &str = "num_write_row_hits";
pub const NUM_WRITE_ROW_MISSES: &str = "num_write_row_misses";

impl SimpleStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&mut self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &'static str, value: u64) {
        *self.counters.entry(name).or_insert(0) += value;
    }

    pub fn get(&self, name: &'static str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn command_issued(&mut self, kind: CommandKind) {
        let name = match kind {
            CommandKind::Read => "num_read_cmds",
            CommandKind::ReadPrecharge => "num_read_p_cmds",
            CommandKind::Write => "num_write_cmds",
            CommandKind::WritePrecharge => "num_write_p_cmds",
            CommandKind::Activate => "num_act_cmds",
            CommandKind::Precharge => "num_pre_cmds",
            CommandKind::RefreshBank => "num_refb_cmds",
            CommandKind::Refresh => "num_ref_cmds",
            CommandKind::SrefEnter => "num_srefe_cmds",
            CommandKind::SrefExit => "num_srefx_cmds",
        };
        self.inc(name);
    }

    pub fn record_read_latency(&mut self, added_cycle: u64, complete_cycle: u64) {
        self.read_latency_sum += complete_cycle.saturating_sub(added_cycle);
        self.read_latency_count += 1;
    }

    fn row_hit_rate(&self) -> f64 {
        let hits = self.get(NUM_READ_ROW_HITS) + self.get(NUM_WRITE_ROW_HITS);
        let misses = self.get(NUM_READ_ROW_MISSES) + self.get(NUM_WRITE_ROW_MISSES);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    fn avg_read_latency(&self) -> f64 {
        if self.read_latency_count == 0 {
            0.0
        } else {
            self.read_latency_sum as f64 / self.read_latency_count as f64
        }
    }

    /// Delta since the last epoch emission; advances the snapshot.
    pub fn epoch_json(&mut self, channel: usize, clk: u64) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("channel".into(), json!(channel));
        obj.insert("epoch".into(), json!(self.epoch_count));
        obj.insert("clk".into(), json!(clk));
        for (&name, &value) in &self.counters {
            let prev = self.epoch_snapshot.get(name).copied().unwrap_or(0);
            obj.insert(name.into(), json!(value - prev));
        }
        self.epoch_snapshot = self.counters.clone();
        self.epoch_count += 1;
        Value::Object(obj)
    }

    /// Cumulative totals plus derived rates.
    pub fn final_json(&self, clk: u64) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("clk".into(), json!(clk));
        for (&name, &value) in &self.counters {
            obj.insert(name.into(), json!(value));
        }
        obj.insert("row_hit_rate".into(), json!(self.row_hit_rate()));
        obj.insert("avg_read_latency".into(), json!(self.avg_read_latency()));
        Value::Object(obj)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_json_reports_deltas() {
        let mut stats = SimpleStats::new();
        stats.command_issued(CommandKind::Read);
        stats.command_issued(CommandKind::Read);
        let first = stats.epoch_json(0, 100);
        assert_eq!(first["num_read_cmds"], 2);
        assert_eq!(first["epoch"], 0);

        stats.command_issued(CommandKind::Read);
        let second = stats.epoch_json(0, 200);
        assert_eq!(second["num_read_cmds"], 1);
        assert_eq!(second["epoch"], 1);
    }

    #[test]
    fn final_json_has_rates() {
        let mut stats = SimpleStats::new();
        stats.inc(NUM_READ_ROW_HITS);
        stats.inc(NUM_READ_ROW_HITS);
        stats.inc(NUM_READ_ROW_MISSES);
        stats.record_read_latency(10, 40);
        stats.record_read_latency(20, 40);
        let v = stats.final_json(500);
        assert!((v["row_hit_rate"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((v["avg_read_latency"].as_f64().unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(v["clk"], 500);
    }
}
