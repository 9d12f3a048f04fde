/*!
Static command-to-command timing table.

For every command kind this table lists, per scope, the commands it
constrains and the minimum clock delta to them:

- `same_bank`: the bank the command targets.
- `other_banks_same_bankgroup`: sibling banks inside the bank-group (the
  long-CCD domain).
- `other_bankgroups`: banks in the same rank but a different bank-group (the
  short-CCD domain).
- `other_ranks`: every bank in every other rank (bus turnaround).
- `same_rank`: every bank of the target rank; used by rank-scope commands
  (REFRESH, SREF_ENTER/EXIT).

The table is derived from the config once and immutable thereafter.
Consumers add each `delta` onto the issue clock and fold the result into the
per-bank earliest-legal-clock arrays; they never interpret the constants
themselves.
*/

use crate::command::CommandKind;
use crate::config::Config;

/// `(constrained kind, minimum delta in clocks)`.
pub type TimingEntry = (CommandKind, u64);

#[derive(Clone, Debug)]
pub struct Timing {
    pub same_bank: Vec<Vec<TimingEntry>>,
    pub other_banks_same_bankgroup: Vec<Vec<TimingEntry>>,
    pub other_bankgroups: Vec<Vec<TimingEntry>>,
    pub other_ranks: Vec<Vec<TimingEntry>>,
    pub same_rank: Vec<Vec<TimingEntry>>,
}

impl Timing {
    pub fn new(config: &Config) -> Self {
        let t = &config.timing;
        let burst = config.burst_cycle();
        let read_l = t.al + t.cl;
        let write_l = t.al + t.cwl;

        let read_to_read_l = burst.max(t.tccd_l);
        let read_to_read_s = burst.max(t.tccd_s);
        // Read data must clear the bus (plus a rank-switch gap) before write
        // data can be driven.
        let read_to_write = (read_l + burst + t.trtrs).saturating_sub(write_l);
        let read_to_write_o = read_to_write;
        let read_to_read_o = burst + t.trtrs;
        let read_to_precharge = t.trtp;
        let read_to_activate = t.trtp + t.trp;

        let write_to_read_l = write_l + burst + t.twtr_l;
        let write_to_read_s = write_l + burst + t.twtr_s;
        let write_to_read_o = (write_l + burst + t.trtrs).saturating_sub(read_l);
        let write_to_write_l = burst.max(t.tccd_l);
        let write_to_write_s = burst.max(t.tccd_s);
        let write_to_write_o = burst + t.trtrs;
        let write_to_precharge = write_l + burst + t.twr;
        let write_to_activate = write_to_precharge + t.trp;

        let act_to_rw = t.trcd;
        let act_to_act_l = t.trrd_l;
        let act_to_act_s = t.trrd_s;
        let act_to_precharge = t.tras;
        let act_to_act_same = t.trc;
        let act_to_refresh = t.trc;

        let pre_to_act = t.trp;
        let pre_to_refresh = t.trp;

        let refb_to_act_same = t.trfcb;
        let refb_to_refb_l = t.trrd_l.max(t.trfcb / 4);
        let refb_to_refb_s = t.trrd_s;

        let ref_to_cmd = t.trfc;
        let sref_exit_delay = t.txs;

        let reads = [CommandKind::Read, CommandKind::ReadPrecharge];
        let writes = [CommandKind::Write, CommandKind::WritePrecharge];

        let mut table = Self {
            same_bank: vec![Vec::new(); CommandKind::COUNT],
            other_banks_same_bankgroup: vec![Vec::new(); CommandKind::COUNT],
            other_bankgroups: vec![Vec::new(); CommandKind::COUNT],
            other_ranks: vec![Vec::new(); CommandKind::COUNT],
            same_rank: vec![Vec::new(); CommandKind::COUNT],
        };

        let fan =
            |rows: &mut Vec<Vec<TimingEntry>>, from: CommandKind, kinds: &[CommandKind], d: u64| {
                for &k in kinds {
                    rows[from.index()].push((k, d));
                }
            };

        // READ / READ_PRECHARGE as constrainers.
        for from in reads {
            fan(&mut table.same_bank, from, &reads, read_to_read_l);
            fan(&mut table.same_bank, from, &writes, read_to_write);
            fan(
                &mut table.other_banks_same_bankgroup,
                from,
                &reads,
                read_to_read_l,
            );
            fan(
                &mut table.other_banks_same_bankgroup,
                from,
                &writes,
                read_to_write,
            );
            fan(&mut table.other_bankgroups, from, &reads, read_to_read_s);
            fan(&mut table.other_bankgroups, from, &writes, read_to_write);
            fan(&mut table.other_ranks, from, &reads, read_to_read_o);
            fan(&mut table.other_ranks, from, &writes, read_to_write_o);
        }
        fan(
            &mut table.same_bank,
            CommandKind::Read,
            &[CommandKind::Precharge],
            read_to_precharge,
        );
        // An auto-precharging read constrains the next row open directly.
        fan(
            &mut table.same_bank,
            CommandKind::ReadPrecharge,
            &[
                CommandKind::Activate,
                CommandKind::RefreshBank,
                CommandKind::Refresh,
                CommandKind::SrefEnter,
            ],
            read_to_activate,
        );

        // WRITE / WRITE_PRECHARGE as constrainers.
        for from in writes {
            fan(&mut table.same_bank, from, &reads, write_to_read_l);
            fan(&mut table.same_bank, from, &writes, write_to_write_l);
            fan(
                &mut table.other_banks_same_bankgroup,
                from,
                &reads,
                write_to_read_l,
            );
            fan(
                &mut table.other_banks_same_bankgroup,
                from,
                &writes,
                write_to_write_l,
            );
            fan(&mut table.other_bankgroups, from, &reads, write_to_read_s);
            fan(&mut table.other_bankgroups, from, &writes, write_to_write_s);
            fan(&mut table.other_ranks, from, &reads, write_to_read_o);
            fan(&mut table.other_ranks, from, &writes, write_to_write_o);
        }
        fan(
            &mut table.same_bank,
            CommandKind::Write,
            &[CommandKind::Precharge],
            write_to_precharge,
        );
        fan(
            &mut table.same_bank,
            CommandKind::WritePrecharge,
            &[
                CommandKind::Activate,
                CommandKind::RefreshBank,
                CommandKind::Refresh,
                CommandKind::SrefEnter,
            ],
            write_to_activate,
        );

        // ACTIVATE.
        fan(&mut table.same_bank, CommandKind::Activate, &reads, act_to_rw);
        fan(&mut table.same_bank, CommandKind::Activate, &writes, act_to_rw);
        fan(
            &mut table.same_bank,
            CommandKind::Activate,
            &[CommandKind::Precharge],
            act_to_precharge,
        );
        fan(
            &mut table.same_bank,
            CommandKind::Activate,
            &[CommandKind::Activate],
            act_to_act_same,
        );
        fan(
            &mut table.same_bank,
            CommandKind::Activate,
            &[CommandKind::RefreshBank],
            act_to_refresh,
        );
        fan(
            &mut table.other_banks_same_bankgroup,
            CommandKind::Activate,
            &[CommandKind::Activate, CommandKind::RefreshBank],
            act_to_act_l,
        );
        fan(
            &mut table.other_bankgroups,
            CommandKind::Activate,
            &[CommandKind::Activate, CommandKind::RefreshBank],
            act_to_act_s,
        );

        // PRECHARGE. Rank-scope readiness (REFRESH/SREF_ENTER) is checked on
        // every bank of the rank, so those constraints live in same_bank.
        fan(
            &mut table.same_bank,
            CommandKind::Precharge,
            &[
                CommandKind::Activate,
                CommandKind::RefreshBank,
                CommandKind::Refresh,
                CommandKind::SrefEnter,
            ],
            pre_to_act.max(pre_to_refresh),
        );

        // REFRESH_BANK.
        fan(
            &mut table.same_bank,
            CommandKind::RefreshBank,
            &[CommandKind::Activate, CommandKind::RefreshBank],
            refb_to_act_same,
        );
        fan(
            &mut table.other_banks_same_bankgroup,
            CommandKind::RefreshBank,
            &[CommandKind::Activate, CommandKind::RefreshBank],
            refb_to_refb_l,
        );
        fan(
            &mut table.other_bankgroups,
            CommandKind::RefreshBank,
            &[CommandKind::Activate, CommandKind::RefreshBank],
            refb_to_refb_s,
        );

        // Rank-scope commands constrain the whole rank.
        fan(
            &mut table.same_rank,
            CommandKind::Refresh,
            &[
                CommandKind::Activate,
                CommandKind::Refresh,
                CommandKind::RefreshBank,
                CommandKind::SrefEnter,
            ],
            ref_to_cmd,
        );
        fan(
            &mut table.same_rank,
            CommandKind::SrefEnter,
            &[CommandKind::SrefExit],
            t.tckesr,
        );
        fan(
            &mut table.same_rank,
            CommandKind::SrefExit,
            &[
                CommandKind::Activate,
                CommandKind::Refresh,
                CommandKind::RefreshBank,
                CommandKind::SrefEnter,
            ],
            sref_exit_delay,
        );

        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::small_config;

    fn delta(entries: &[TimingEntry], kind: CommandKind) -> Option<u64> {
        entries.iter().find(|(k, _)| *k == kind).map(|&(_, d)| d)
    }

    #[test]
    fn ccd_long_vs_short() {
        let cfg = small_config();
        let timing = Timing::new(&cfg);
        let rd = CommandKind::Read.index();
        let long = delta(&timing.other_banks_same_bankgroup[rd], CommandKind::Read).unwrap();
        let short = delta(&timing.other_bankgroups[rd], CommandKind::Read).unwrap();
        assert!(long >= short, "tCCD_L must dominate tCCD_S");
        assert_eq!(long, cfg.burst_cycle().max(cfg.timing.tccd_l));
    }

    #[test]
    fn activate_row_cycle() {
        let cfg = small_config();
        let timing = Timing::new(&cfg);
        let act = CommandKind::Activate.index();
        assert_eq!(
            delta(&timing.same_bank[act], CommandKind::Activate),
            Some(cfg.timing.trc)
        );
        assert_eq!(
            delta(&timing.same_bank[act], CommandKind::Read),
            Some(cfg.timing.trcd)
        );
        assert_eq!(
            delta(&timing.same_bank[act], CommandKind::Precharge),
            Some(cfg.timing.tras)
        );
    }

    #[test]
    fn refresh_blankets_rank() {
        let cfg = small_config();
        let timing = Timing::new(&cfg);
        let rf = CommandKind::Refresh.index();
        assert_eq!(
            delta(&timing.same_rank[rf], CommandKind::Activate),
            Some(cfg.timing.trfc)
        );
        assert_eq!(
            delta(&timing.same_rank[rf], CommandKind::Refresh),
            Some(cfg.timing.trfc)
        );
    }

    #[test]
    fn sref_exit_forces_txs() {
        let cfg = small_config();
        let timing = Timing::new(&cfg);
        let sx = CommandKind::SrefExit.index();
        assert_eq!(
            delta(&timing.same_rank[sx], CommandKind::Activate),
            Some(cfg.timing.txs)
        );
    }
}
