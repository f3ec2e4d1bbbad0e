//! Concurrent allocate, correct and release stress run.
//!
//! Every round schedules more block requests than the pool can hold at once
//! onto a rayon pool. Each task allocates an error-correctable block, injects
//! a bit flip on a qubit the syndrome table repairs, corrects it and releases
//! the block. Refused allocations are expected; any other error, a wrong
//! correction, or leaked capacity at the end of a round fails the run.

use crate::stats::LatencyStats;
use anyhow::{Context, Result, ensure};
use qrm_common::limits::BUFFER_SIZE_MIN;
use qrm_common::{BlockFlags, Gate};
use qrm_core::{Correction, FrameBackend, QrmError, Runtime, RuntimeConfig};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Tasks scheduled per worker thread in each round.
const TASKS_PER_THREAD: usize = 8;

#[derive(Default)]
struct Tally {
    alloc: LatencyStats,
    correct: LatencyStats,
    completed: u64,
    refused: u64,
}

impl Tally {
    fn merge(self, other: Tally) -> Tally {
        Tally {
            alloc: self.alloc.merge(&other.alloc),
            correct: self.correct.merge(&other.correct),
            completed: self.completed + other.completed,
            refused: self.refused + other.refused,
        }
    }
}

fn run_task(runtime: &Runtime, frame: &FrameBackend, block: usize, task: usize) -> Result<Tally> {
    let mut tally = Tally::default();

    let start = Instant::now();
    let handle = match runtime.pool().allocate(block, BlockFlags::ERROR_CORRECTABLE) {
        Ok(handle) => handle,
        Err(QrmError::CapacityExceeded { .. }) => {
            tally.refused = 1;
            return Ok(tally);
        }
        Err(e) => return Err(e.into()),
    };
    tally.alloc.record(start.elapsed());

    let stats = runtime.pool().stats();
    ensure!(
        stats.allocated_qubits <= stats.max_qubits,
        "pool over-allocated: {} of {}",
        stats.allocated_qubits,
        stats.max_qubits
    );

    // syndromes 1 and 2 map back to the flipped qubit
    let qubit = task % 2;
    frame.inject(handle.state_handle()?, Gate::X, qubit)?;
    let start = Instant::now();
    let correction = handle.correct(runtime.engine())?;
    tally.correct.record(start.elapsed());
    ensure!(
        correction == Correction::BitFlip(qubit),
        "{} corrected with {correction}, expected bit-flip q{qubit}",
        handle.id()
    );
    ensure!(handle.measure_qubit(qubit)? == 0, "{} still flipped", handle.id());

    ensure!(
        runtime.pool().release(&handle)?,
        "{} survived its only release",
        handle.id()
    );
    tally.completed = 1;
    Ok(tally)
}

/// Runs the stress loop and prints throughput and latency reports.
///
/// # Arguments
///
/// * `threads` - Worker threads in the rayon pool
/// * `max_qubits` - Pool ceiling
/// * `block` - Qubits per allocated block
/// * `rounds` - Number of rounds; the pool must be empty after each one
pub fn run_stress(threads: usize, max_qubits: usize, block: usize, rounds: usize) -> Result<()> {
    ensure!(threads > 0, "at least one thread is required");
    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Failed to build worker pool")?;

    let frame = Arc::new(FrameBackend::new());
    let config = RuntimeConfig {
        max_qubits,
        buffer_capacity: BUFFER_SIZE_MIN,
    };
    let runtime = Runtime::init(config, frame.clone()).context("Failed to initialize runtime")?;
    let baseline_states = frame.live_states();
    let tasks = threads * TASKS_PER_THREAD;

    println!(
        "Stress: {threads} threads, {rounds} rounds of {tasks} tasks, {block}-qubit blocks, ceiling {max_qubits}"
    );
    let start = Instant::now();
    let mut total = Tally::default();

    for round in 0..rounds {
        let tally = workers.install(|| {
            (0..tasks)
                .into_par_iter()
                .map(|task| run_task(&runtime, &frame, block, task))
                .try_reduce(Tally::default, |a, b| Ok(a.merge(b)))
        })?;
        total = total.merge(tally);

        let stats = runtime.pool().stats();
        ensure!(
            stats.allocated_qubits == 0 && runtime.pool().in_use() == 0,
            "round {round}: {} qubits still allocated",
            stats.allocated_qubits
        );
        ensure!(
            frame.live_states() == baseline_states,
            "round {round}: {} backend states leaked",
            frame.live_states() - baseline_states
        );
    }

    let elapsed = start.elapsed().as_secs_f64();
    println!("Results");
    println!("Time:       {elapsed:.4} s");
    println!(
        "Throughput: {:.2} blocks/s",
        total.completed as f64 / elapsed.max(f64::EPSILON)
    );
    println!("Completed:  {}", total.completed);
    println!("Refused:    {}", total.refused);
    if let Ok(engine) = runtime.engine().get_stats() {
        println!(
            "Engine:     {} measured, {} corrected ({}%)",
            engine.error_count, engine.correction_count, engine.success_rate
        );
    }
    total.alloc.print_report("Allocation Latency");
    total.correct.print_report("Correction Latency");

    info!(
        total_qubits_ever = runtime.pool().stats().total_qubits_ever,
        "stress run finished"
    );
    runtime.shutdown();
    Ok(())
}
