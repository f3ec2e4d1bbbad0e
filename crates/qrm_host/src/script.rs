//! Script execution on the Pauli-frame backend.

use anyhow::{Context, Result};
use qrm_core::vm::{Outcome, Session};
use qrm_core::{FrameBackend, Runtime, RuntimeConfig};
use qrm_io::{loader, parser};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Parses and executes `path`, printing one line per instruction.
///
/// # Arguments
///
/// * `path` - Workload script
/// * `config` - Pool ceiling and bridge capacity for the runtime
/// * `b8_path` - Optional output file for decoded outcome vectors. Each
///   record is zero-padded to `config.buffer_capacity` outcomes, so the file
///   reads back with `slice_outcomes(bits, config.buffer_capacity)`.
/// * `keep_going` - Continue after a failing instruction instead of stopping
///
/// # Returns
///
/// Ok(()) when every instruction succeeded, or when `keep_going` is set and
/// the script ran to the end.
pub fn run_script(
    path: &Path,
    config: RuntimeConfig,
    b8_path: Option<&Path>,
    keep_going: bool,
) -> Result<()> {
    let program = parser::load_script_file(path)?;
    info!(instructions = program.len(), script = %path.display(), "script loaded");

    let frame = Arc::new(FrameBackend::new());
    let runtime = Runtime::init(config, frame.clone()).context("Failed to initialize runtime")?;
    let mut session = Session::new(&runtime).with_injector(frame);

    let mut records = Vec::new();
    let mut failures = 0usize;
    let start = Instant::now();

    for (index, instr) in program.iter().enumerate() {
        match session.execute(instr) {
            Ok(outcome) => {
                println!("{:>5}  {:<40} {}", index + 1, instr.to_string(), outcome);
                if let Outcome::Decoded(mut bits) = outcome {
                    bits.resize(config.buffer_capacity, 0);
                    records.push(bits);
                }
            }
            Err(e) if keep_going => {
                failures += 1;
                error!(instruction = index + 1, %instr, "{e}");
                println!("{:>5}  {:<40} error: {e}", index + 1, instr.to_string());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("instruction {} (`{instr}`) failed", index + 1));
            }
        }
    }

    println!(
        "executed {} instructions in {:?} ({} failed)",
        program.len(),
        start.elapsed(),
        failures
    );

    if let Some(b8) = b8_path {
        loader::write_b8_file(b8, &records)?;
        println!("wrote {} outcome records to {}", records.len(), b8.display());
    }

    drop(session);
    runtime.shutdown();
    Ok(())
}
