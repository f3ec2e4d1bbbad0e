//! Core resource management and error correction for qubit blocks.
//!
//! This crate provides the capacity-bounded block allocator, the
//! syndrome-table correction engine, and the bridge between classical byte
//! buffers and quantum states. Quantum states themselves are opaque: every
//! gate and measurement goes through the `StateBackend` seam, so the same
//! allocator and engine run on a real device driver or on the bundled
//! Pauli-frame model.

use qrm_common::BlockId;
use thiserror::Error;

/// Quantum state primitive seam.
///
/// Defines the backend trait that allocates, mutates and measures opaque
/// state handles, and the owned state type that frees its handle when it
/// goes out of scope. Everything else in the crate reaches quantum state only
/// through this module.
pub mod state;

/// Deterministic Pauli-frame state backend.
///
/// Tracks X and Z error bits per qubit instead of amplitudes. Used as the
/// default backend for scripts and stress runs, and as a test double with
/// error and fault injection.
pub mod frame;

/// Capacity-bounded block allocator.
///
/// Hands out reference-counted memory blocks, each owning one state, while
/// keeping the total number of allocated qubits under the pool ceiling.
pub mod pool;

/// Syndrome measurement and table-driven correction.
///
/// Couples a state to a shared ancilla register, measures the syndrome and
/// applies the corrective gate from a fixed eight-entry table. Calls are
/// serialized process-wide because the ancilla is a single resource.
pub mod correction;

/// Conversion between classical byte buffers and quantum states.
///
/// Encodes bytes into an interface state, measures it back into bytes, and
/// runs gate-then-correct controlled operations.
pub mod bridge;

/// Runtime context owning the backend, pool, engine and bridge.
///
/// Replaces implicit global initialization order with one value that is
/// built by `init` and torn down by `shutdown`.
pub mod runtime;

/// Interpreter for workload instructions.
///
/// Maps named slots to blocks and executes allocation, gate, correction and
/// conversion instructions against a runtime, one at a time.
pub mod vm;

/// Errors returned by allocator, engine, bridge and backend operations.
///
/// Every error is returned to the immediate caller; nothing in this crate
/// retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QrmError {
    /// An argument was rejected before any state was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A block was requested with zero qubits or more than the per-block
    /// maximum.
    #[error("invalid block size {requested} (allowed 1..={max})")]
    InvalidSize { requested: usize, max: usize },

    /// Granting the request would push allocated qubits past the pool
    /// ceiling.
    #[error("capacity exceeded: requested {requested} qubits, {available} free")]
    CapacityExceeded { requested: usize, available: usize },

    /// The state backend could not allocate a state.
    #[error("state backend out of memory")]
    OutOfMemory,

    /// The pool ceiling cannot be lowered below the qubits already allocated.
    #[error("invalid capacity {requested}: {allocated} qubits are allocated")]
    InvalidCapacity { requested: usize, allocated: usize },

    /// The block has already been destroyed.
    #[error("block {0} is no longer live")]
    NullBlock(BlockId),

    /// The state backend failed a gate, measurement or readout.
    #[error("gate failure: {0}")]
    GateFailure(String),

    /// Statistics were requested before any syndrome measurement.
    #[error("division by zero: no syndrome measurements recorded")]
    DivideByZero,
}

pub type Result<T> = core::result::Result<T, QrmError>;

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// Critical sections in this crate restore their invariants before any call
/// that can panic, so a poisoned lock still guards consistent data.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub use bridge::{BridgeStats, ClassicalBridge};
pub use correction::{Correction, CorrectionEngine, CorrectionStats, Syndrome};
pub use frame::FrameBackend;
pub use pool::{Block, BlockPool, MemoryBlock, PoolStats};
pub use runtime::{Runtime, RuntimeConfig};
pub use state::{Control, OwnedState, StateBackend, StateHandle};
