#![doc = r#"
Cycle-accurate simulator for a heterogeneous memory hierarchy: a conventional
DRAM subsystem coupled with a Processing-in-Memory extension for
embedding-lookup/reduction workloads.

Modules:
- address: linear-address <-> bank-coordinate mapping and its inverse
- bank_state: per-bank FSM and earliest-legal-command clocks
- cache: rank-side set-associative LRU filter for reference vectors
- channel_state: per-channel bank grid, tFAW window, self-refresh tracking
- command: command/transaction value types and PIM metadata
- command_queue: per-bank/per-bankgroup FIFOs with row-buffer policy hooks
- config: TOML configuration, validation, derived parameters
- controller: per-channel orchestrator (scheduling, completions, PIM routing)
- dram_system: channel fan-out, mega-tick batching, completion callbacks
- error: typed error kinds (all fatal except trace-parse)
- host: NMP loop driving two memories at a configurable clock ratio
- memory_system: host-facing facade over one DRAM system
- pim: PIM instruction engine, completion ALU, NMP adder stage
- refresh: periodic refresh injection with bounded postponement
- stats: per-channel counters and JSON reporting
- timing: static command-to-command timing table
- trace: embedding-trace loader (pooling batches, CA-compression)

In tests, shared fixture builders are available under `crate::test_utils`.
"#]

pub mod address;
pub mod bank_state;
pub mod cache;
pub mod channel_state;
pub mod command;
pub mod command_queue;
pub mod config;
pub mod controller;
pub mod dram_system;
pub mod error;
pub mod host;
pub mod memory_system;
pub mod pim;
pub mod refresh;
pub mod stats;
pub mod timing;
pub mod trace;

// Re-export commonly used types at the crate root for convenience.
pub use command::{Command, CommandKind, PimValues, Transaction};
pub use config::Config;
pub use error::SimError;
pub use host::EmbeddingHost;
pub use memory_system::MemorySystem;

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
