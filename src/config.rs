/*!
Configuration loading, validation, and derived address/timing parameters.

Two layers, parsed with serde + toml:
- `ConfigFile`: the raw TOML shape (`[dram_structure]`, `[timing]`,
  `[system]`, `[pim]`, `[sram]` tables), every field individually defaulted so
  sparse files work. Unknown fields are tolerated.
- `Config`: the validated, immutable runtime object. Construction derives the
  address mapper from the bit-field permutation and checks the §-level
  invariants (topology counts are powers of two, core timings non-zero, PIM
  requires a batch size, SRAM geometry divides evenly). Any violation is a
  `SimError::ConfigurationInvalid`.

Components hold an `Rc<Config>`; nothing mutates it after construction.
*/

use std::fs;
use std::path::Path;
use std::rc::Rc;

use serde::Deserialize;

use crate::address::{Address, AddressMapper};
use crate::error::SimError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RowBufPolicy {
    OpenPage,
    ClosePage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueStructure {
    PerBank,
    PerBankGroup,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// One REFRESH per rank every tREFI, ranks staggered across the interval.
    RankStaggered,
    /// One REFRESH_BANK at a time, rotating through every bank.
    BankStaggered,
}

// ---------------- raw TOML shape ----------------

fn d_channels() -> usize {
    1
}
fn d_ranks() -> usize {
    1
}
fn d_bankgroups() -> usize {
    4
}
fn d_banks_per_group() -> usize {
    4
}
fn d_rows() -> usize {
    1 << 14
}
fn d_columns() -> usize {
    1 << 5
}
fn d_bus_width() -> usize {
    64
}
fn d_burst_length() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructureSection {
    #[serde(default = "d_channels")]
    pub channels: usize,
    #[serde(default = "d_ranks")]
    pub ranks: usize,
    #[serde(default = "d_bankgroups")]
    pub bankgroups: usize,
    #[serde(default = "d_banks_per_group")]
    pub banks_per_group: usize,
    #[serde(default = "d_rows")]
    pub rows: usize,
    #[serde(default = "d_columns")]
    pub columns: usize,
    #[serde(default = "d_bus_width")]
    pub bus_width: usize,
    #[serde(default = "d_burst_length")]
    pub burst_length: usize,
}

impl Default for StructureSection {
    fn default() -> Self {
        Self {
            channels: d_channels(),
            ranks: d_ranks(),
            bankgroups: d_bankgroups(),
            banks_per_group: d_banks_per_group(),
            rows: d_rows(),
            columns: d_columns(),
            bus_width: d_bus_width(),
            burst_length: d_burst_length(),
        }
    }
}

macro_rules! timing_defaults {
    ($($field:ident = $val:expr),+ $(,)?) => {
        $(fn $field() -> u64 { $val })+
    };
}

timing_defaults!(
    d_cl = 14,
    d_cwl = 10,
    d_al = 0,
    d_trc = 47,
    d_trcd = 14,
    d_trp = 14,
    d_tras = 33,
    d_tccd_s = 2,
    d_tccd_l = 4,
    d_trtp = 6,
    d_twtr_s = 3,
    d_twtr_l = 8,
    d_twr = 15,
    d_trrd_s = 4,
    d_trrd_l = 6,
    d_tfaw = 16,
    d_trefi = 3900,
    d_trefib = 487,
    d_trfc = 260,
    d_trfcb = 90,
    d_trtrs = 2,
    d_txs = 270,
    d_tckesr = 8,
);

fn d_tck() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingSection {
    #[serde(default = "d_tck")]
    pub tck: f64,
    #[serde(default = "d_cl")]
    pub cl: u64,
    #[serde(default = "d_cwl")]
    pub cwl: u64,
    #[serde(default = "d_al")]
    pub al: u64,
    #[serde(default = "d_trc")]
    pub trc: u64,
    #[serde(default = "d_trcd")]
    pub trcd: u64,
    #[serde(default = "d_trp")]
    pub trp: u64,
    #[serde(default = "d_tras")]
    pub tras: u64,
    #[serde(default = "d_tccd_s")]
    pub tccd_s: u64,
    #[serde(default = "d_tccd_l")]
    pub tccd_l: u64,
    #[serde(default = "d_trtp")]
    pub trtp: u64,
    #[serde(default = "d_twtr_s")]
    pub twtr_s: u64,
    #[serde(default = "d_twtr_l")]
    pub twtr_l: u64,
    #[serde(default = "d_twr")]
    pub twr: u64,
    #[serde(default = "d_trrd_s")]
    pub trrd_s: u64,
    #[serde(default = "d_trrd_l")]
    pub trrd_l: u64,
    #[serde(default = "d_tfaw")]
    pub tfaw: u64,
    #[serde(default = "d_trefi")]
    pub trefi: u64,
    #[serde(default = "d_trefib")]
    pub trefib: u64,
    #[serde(default = "d_trfc")]
    pub trfc: u64,
    #[serde(default = "d_trfcb")]
    pub trfcb: u64,
    #[serde(default = "d_trtrs")]
    pub trtrs: u64,
    #[serde(default = "d_txs")]
    pub txs: u64,
    #[serde(default = "d_tckesr")]
    pub tckesr: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        toml::from_str("").expect("empty timing table deserializes to defaults")
    }
}

fn d_mapping() -> String {
    "rochrababgco".to_string()
}
fn d_queue_size() -> usize {
    32
}
fn d_pending_queue_size() -> usize {
    64
}
fn d_write_buf_high() -> usize {
    24
}
fn d_write_buf_low() -> usize {
    8
}
fn d_row_buf_policy() -> String {
    "OPEN_PAGE".to_string()
}
fn d_queue_structure() -> String {
    "PER_BANK".to_string()
}
fn d_refresh_policy() -> String {
    "RANK_STAGGERED".to_string()
}
fn d_max_postpone() -> u64 {
    4
}
fn d_sref_idle_window() -> u64 {
    1000
}
fn d_mega_tick() -> u64 {
    1
}
fn d_epoch_period() -> u64 {
    100_000
}
fn d_output_prefix() -> String {
    "pimsim".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    #[serde(default = "d_mapping")]
    pub address_mapping: String,
    #[serde(default = "d_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub unified_queue: bool,
    #[serde(default = "d_pending_queue_size")]
    pub pending_queue_size: usize,
    #[serde(default = "d_write_buf_high")]
    pub write_buf_high: usize,
    #[serde(default = "d_write_buf_low")]
    pub write_buf_low: usize,
    #[serde(default = "d_row_buf_policy")]
    pub row_buf_policy: String,
    #[serde(default = "d_queue_structure")]
    pub queue_structure: String,
    #[serde(default = "d_refresh_policy")]
    pub refresh_policy: String,
    #[serde(default = "d_max_postpone")]
    pub max_postpone: u64,
    #[serde(default)]
    pub enable_self_refresh: bool,
    #[serde(default = "d_sref_idle_window")]
    pub sref_idle_window: u64,
    #[serde(default = "d_mega_tick")]
    pub mega_tick: u64,
    #[serde(default = "d_epoch_period")]
    pub epoch_period: u64,
    #[serde(default = "d_output_prefix")]
    pub output_prefix: String,
}

impl Default for SystemSection {
    fn default() -> Self {
        toml::from_str("").expect("empty system table deserializes to defaults")
    }
}

fn d_batch_size() -> usize {
    4
}
fn d_pim_cycle() -> u64 {
    4
}
fn d_decode_cycle() -> u64 {
    2
}
fn d_skewed_cycle() -> u64 {
    1
}
fn d_add_cycle() -> u64 {
    3
}
fn d_pim_ticks() -> u64 {
    4
}
fn d_mem_ticks() -> u64 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct PimSection {
    #[serde(default)]
    pub pim_enabled: bool,
    #[serde(default)]
    pub lut_enabled: bool,
    #[serde(default)]
    pub ca_compression: bool,
    #[serde(default)]
    pub hot_replication: bool,
    #[serde(default = "d_batch_size")]
    pub batch_size: usize,
    #[serde(default = "d_pim_cycle")]
    pub pim_cycle: u64,
    #[serde(default = "d_decode_cycle")]
    pub decode_cycle: u64,
    #[serde(default = "d_skewed_cycle")]
    pub skewed_cycle: u64,
    #[serde(default = "d_add_cycle")]
    pub add_cycle: u64,
    /// Transactions injectable into the PIM memory per host tick.
    /// Defaults to 1, or 3 under CA-compression; explicit values win.
    #[serde(default)]
    pub num_ca_in_cycle: Option<usize>,
    /// Host clock-ratio pair: PIM memory ticks per period...
    #[serde(default = "d_pim_ticks")]
    pub pim_ticks_per_period: u64,
    /// ...and commodity memory ticks per period.
    #[serde(default = "d_mem_ticks")]
    pub mem_ticks_per_period: u64,
}

impl Default for PimSection {
    fn default() -> Self {
        toml::from_str("").expect("empty pim table deserializes to defaults")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SramSection {
    #[serde(default)]
    pub sram_enabled: bool,
    #[serde(default)]
    pub sram_size: usize,
    #[serde(default)]
    pub sram_block: usize,
    #[serde(default)]
    pub sram_assoc: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub dram_structure: StructureSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub system: SystemSection,
    #[serde(default)]
    pub pim: PimSection,
    #[serde(default)]
    pub sram: SramSection,
}

// ---------------- validated runtime config ----------------

#[derive(Debug, Clone)]
pub struct Config {
    pub structure: StructureSection,
    pub timing: TimingSection,
    pub system: SystemSection,
    pub pim: PimSection,
    pub sram: SramSection,

    pub row_buf_policy: RowBufPolicy,
    pub queue_structure: QueueStructure,
    pub refresh_policy: RefreshPolicy,

    mapper: AddressMapper,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Rc<Self>, SimError> {
        let text = fs::read_to_string(&path).map_err(|e| {
            SimError::ConfigurationInvalid(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Rc<Self>, SimError> {
        let file: ConfigFile = toml::from_str(text)
            .map_err(|e| SimError::ConfigurationInvalid(e.to_string()))?;
        Self::from_parsed(file).map(Rc::new)
    }

    pub fn from_parsed(file: ConfigFile) -> Result<Self, SimError> {
        let ConfigFile {
            dram_structure: structure,
            timing,
            system,
            pim,
            sram,
        } = file;

        let invalid = |msg: String| Err(SimError::ConfigurationInvalid(msg));

        let row_buf_policy = match system.row_buf_policy.as_str() {
            "OPEN_PAGE" => RowBufPolicy::OpenPage,
            "CLOSE_PAGE" => RowBufPolicy::ClosePage,
            other => return invalid(format!("unknown row_buf_policy '{other}'")),
        };
        let queue_structure = match system.queue_structure.as_str() {
            "PER_BANK" => QueueStructure::PerBank,
            "PER_BANKGROUP" => QueueStructure::PerBankGroup,
            other => return invalid(format!("unknown queue_structure '{other}'")),
        };
        let refresh_policy = match system.refresh_policy.as_str() {
            "RANK_STAGGERED" => RefreshPolicy::RankStaggered,
            "BANK_STAGGERED" => RefreshPolicy::BankStaggered,
            other => return invalid(format!("unknown refresh_policy '{other}'")),
        };

        if timing.tck <= 0.0 {
            return invalid("tCK must be positive".to_string());
        }
        for (name, value) in [
            ("tRC", timing.trc),
            ("tRCD", timing.trcd),
            ("tRP", timing.trp),
            ("tRAS", timing.tras),
            ("tREFI", timing.trefi),
            ("tRFC", timing.trfc),
            ("CL", timing.cl),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be non-zero"));
            }
        }
        if system.queue_size == 0 {
            return invalid("queue_size must be non-zero".to_string());
        }
        if system.write_buf_low > system.write_buf_high {
            return invalid("write_buf_low exceeds write_buf_high".to_string());
        }
        if system.mega_tick == 0 || system.epoch_period == 0 {
            return invalid("mega_tick and epoch_period must be non-zero".to_string());
        }
        if pim.pim_enabled && pim.batch_size == 0 {
            return invalid("PIM enabled without a valid batch_size".to_string());
        }
        if pim.pim_ticks_per_period == 0 || pim.mem_ticks_per_period == 0 {
            return invalid("clock ratio terms must be non-zero".to_string());
        }
        if sram.sram_enabled {
            let ways = sram.sram_block * sram.sram_assoc;
            if ways == 0 || sram.sram_size == 0 || sram.sram_size % ways != 0 {
                return invalid(format!(
                    "sram geometry {}B / {}B blocks / {}-way does not divide evenly",
                    sram.sram_size, sram.sram_block, sram.sram_assoc
                ));
            }
        }

        let request_bytes = structure.burst_length * structure.bus_width / 8;
        let mapper = AddressMapper::new(
            &system.address_mapping,
            structure.channels,
            structure.ranks,
            structure.bankgroups,
            structure.banks_per_group,
            structure.rows,
            structure.columns,
            request_bytes,
        )
        .map_err(SimError::ConfigurationInvalid)?;
        if mapper.mapped_bits() > 64 {
            return invalid(format!(
                "address mapping spans {} bits, more than the 64-bit address",
                mapper.mapped_bits()
            ));
        }

        Ok(Self {
            structure,
            timing,
            system,
            pim,
            sram,
            row_buf_policy,
            queue_structure,
            refresh_policy,
            mapper,
        })
    }

    // ---------------- derived parameters ----------------

    /// Data-bus cycles occupied by one burst.
    #[inline]
    pub fn burst_cycle(&self) -> u64 {
        (self.structure.burst_length / 2) as u64
    }

    /// Issue-to-data-complete latency of a READ.
    #[inline]
    pub fn read_delay(&self) -> u64 {
        self.timing.al + self.timing.cl + self.burst_cycle()
    }

    /// Issue-to-buffered latency of a WRITE.
    #[inline]
    pub fn write_delay(&self) -> u64 {
        self.timing.al + self.timing.cwl + self.burst_cycle()
    }

    #[inline]
    pub fn banks_per_rank(&self) -> usize {
        self.structure.bankgroups * self.structure.banks_per_group
    }

    #[inline]
    pub fn effective_num_ca_in_cycle(&self) -> usize {
        self.pim
            .num_ca_in_cycle
            .unwrap_or(if self.pim.ca_compression { 3 } else { 1 })
    }

    // ---------------- address mapping ----------------

    #[inline]
    pub fn address_mapping(&self, hex_addr: u64) -> Address {
        self.mapper.decode(hex_addr)
    }

    /// Inverse mapping; used for broadcast-prefetch and hot-entry synthesis.
    #[inline]
    pub fn generate_address(&self, addr: &Address) -> u64 {
        self.mapper.encode(addr)
    }

    #[inline]
    pub fn channel_of(&self, hex_addr: u64) -> usize {
        self.mapper.channel_of(hex_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_working_defaults() {
        let cfg = Config::from_toml_str("").expect("defaults validate");
        assert_eq!(cfg.structure.channels, 1);
        assert_eq!(cfg.row_buf_policy, RowBufPolicy::OpenPage);
        assert_eq!(cfg.burst_cycle(), 4);
        assert_eq!(cfg.effective_num_ca_in_cycle(), 1);
    }

    #[test]
    fn full_config_parses() {
        let text = r#"
            [dram_structure]
            channels = 2
            ranks = 1
            bankgroups = 4
            banks_per_group = 4
            rows = 16384
            columns = 32

            [timing]
            tck = 1.25
            cl = 14
            tccd_s = 2
            tccd_l = 4
            tfaw = 16
            trefi = 3900
            trfc = 260

            [system]
            address_mapping = "rochrababgco"
            queue_size = 16
            unified_queue = false
            row_buf_policy = "CLOSE_PAGE"
            queue_structure = "PER_BANKGROUP"
            mega_tick = 2
            epoch_period = 10000

            [pim]
            pim_enabled = true
            lut_enabled = true
            ca_compression = true
            batch_size = 2
            pim_cycle = 4
            decode_cycle = 2
            skewed_cycle = 1

            [sram]
            sram_enabled = true
            sram_size = 4096
            sram_block = 64
            sram_assoc = 4
        "#;
        let cfg = Config::from_toml_str(text).expect("parses");
        assert_eq!(cfg.structure.channels, 2);
        assert_eq!(cfg.row_buf_policy, RowBufPolicy::ClosePage);
        assert_eq!(cfg.queue_structure, QueueStructure::PerBankGroup);
        assert!(cfg.pim.pim_enabled);
        assert_eq!(cfg.effective_num_ca_in_cycle(), 3);
    }

    #[test]
    fn pim_without_batch_size_rejected() {
        let err = Config::from_toml_str("[pim]\npim_enabled = true\nbatch_size = 0\n")
            .unwrap_err();
        assert!(matches!(err, SimError::ConfigurationInvalid(_)));
    }

    #[test]
    fn bad_mapping_rejected() {
        let err =
            Config::from_toml_str("[system]\naddress_mapping = \"xxyyzzwwvvuu\"\n").unwrap_err();
        assert!(matches!(err, SimError::ConfigurationInvalid(_)));
    }

    #[test]
    fn bad_sram_geometry_rejected() {
        let err = Config::from_toml_str(
            "[sram]\nsram_enabled = true\nsram_size = 1000\nsram_block = 64\nsram_assoc = 4\n",
        )
        .unwrap_err();
        assert!(matches!(err, SimError::ConfigurationInvalid(_)));
    }

    #[test]
    fn address_round_trip_through_config() {
        let cfg = Config::from_toml_str("").unwrap();
        let addr = cfg.address_mapping(0x1_2340);
        assert_eq!(cfg.generate_address(&addr), 0x1_2340 & !0x3f);
    }
}
