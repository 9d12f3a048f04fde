//! CLI driver: load two memory configs and a trace, run the embedding host
//! loop to quiescence, and write the per-channel JSON reports.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use pimsim::EmbeddingHost;

#[derive(Parser)]
#[command(name = "pimsim")]
#[command(about = "Cycle-accurate DRAM + PIM simulator for embedding reduction workloads")]
#[command(version)]
struct Cli {
    /// Config for the PIM-capable memory (TOML)
    #[arg(long)]
    pim_config: PathBuf,

    /// Config for the commodity memory (TOML); defaults to the PIM config
    #[arg(long)]
    mem_config: Option<PathBuf>,

    /// Embedding trace file
    #[arg(long)]
    trace: PathBuf,

    /// Directory for epoch/final JSON reports
    #[arg(long, default_value = "out")]
    output_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mem_config = cli.mem_config.as_ref().unwrap_or(&cli.pim_config);
    let mut host = EmbeddingHost::from_files(
        &cli.pim_config,
        mem_config,
        &cli.trace,
        Some(cli.output_dir.as_path()),
    )
    .context("building the simulation")?;

    let summary = host.run().context("running the simulation")?;
    host.write_final_stats(&cli.output_dir)
        .context("writing final stats")?;

    println!("------------ Info ------------");
    println!("- groups processed : {}", summary.groups_processed);
    println!("- transfers        : {}", summary.transfers_consumed);
    println!("- sram hits        : {}", summary.sram_hits);
    println!("- pim cycles       : {}", summary.pim_cycles);
    println!("- mem cycles       : {}", summary.mem_cycles);
    println!("------------------------------");
    Ok(())
}
