mod generator;
mod script;
mod stats;
mod stress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use qrm_common::limits::{BUFFER_SIZE_DEFAULT, MAX_QUBITS, MAX_QUBITS_PER_BLOCK};
use qrm_core::RuntimeConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Qubit resource manager driver.
#[derive(Parser)]
#[command(name = "qrm", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workload script on the Pauli-frame backend.
    Run {
        #[arg(short, long)]
        script: PathBuf,
        #[arg(long, env = "QRM_MAX_QUBITS", default_value_t = MAX_QUBITS)]
        max_qubits: usize,
        #[arg(long, env = "QRM_BUFFER", default_value_t = BUFFER_SIZE_DEFAULT)]
        buffer: usize,
        /// Write every decoded outcome vector to this .b8 file.
        #[arg(long)]
        b8: Option<PathBuf>,
        /// Report failing instructions and continue.
        #[arg(long)]
        keep_going: bool,
    },
    /// Write a random, valid workload script.
    Gen {
        #[arg(short, long, default_value = "workload.qrm")]
        out: PathBuf,
        #[arg(long, default_value_t = 1_000)]
        ops: usize,
        #[arg(long, default_value_t = 12345)]
        seed: u64,
        #[arg(long, env = "QRM_MAX_QUBITS", default_value_t = MAX_QUBITS)]
        max_qubits: usize,
    },
    /// Allocate, correct and release concurrently and check the pool invariants.
    Stress {
        #[arg(short, long, default_value_t = 4)]
        threads: usize,
        #[arg(long, env = "QRM_MAX_QUBITS", default_value_t = MAX_QUBITS)]
        max_qubits: usize,
        #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u64).range(3..=MAX_QUBITS_PER_BLOCK as u64))]
        block: u64,
        #[arg(long, default_value_t = 100)]
        rounds: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            script,
            max_qubits,
            buffer,
            b8,
            keep_going,
        } => {
            let config = RuntimeConfig {
                max_qubits,
                buffer_capacity: buffer,
            };
            script::run_script(&script, config, b8.as_deref(), keep_going)?;
        }
        Commands::Gen {
            out,
            ops,
            seed,
            max_qubits,
        } => {
            generator::generate_workload(&out, ops, seed, max_qubits)?;
        }
        Commands::Stress {
            threads,
            max_qubits,
            block,
            rounds,
        } => {
            stress::run_stress(threads, max_qubits, block as usize, rounds)?;
        }
    }
    Ok(())
}
