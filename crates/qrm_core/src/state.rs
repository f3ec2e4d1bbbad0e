//! Quantum state primitive seam.
//!
//! A backend owns every quantum state and hands out opaque `StateHandle`s.
//! Callers never free handles by hand: `OwnedState` pairs a handle with its
//! backend and frees it exactly once when dropped, so early returns and
//! error paths cannot leak states.

use crate::Result;
use qrm_common::Gate;
use std::fmt;
use std::sync::Arc;

/// Opaque identifier of a state owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateHandle(pub u64);

impl fmt::Display for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// Control qubit for a controlled gate. The control may live in a
/// different state than the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    /// State holding the control qubit.
    pub handle: StateHandle,
    /// Control qubit index within `handle`.
    pub qubit: usize,
}

impl Control {
    pub fn new(handle: StateHandle, qubit: usize) -> Self {
        Self { handle, qubit }
    }
}

/// Quantum state primitive.
///
/// Implementations must be safe to call from several threads at once; the
/// allocator, engine and bridge each hold their own critical sections and do
/// not serialize backend calls across one another. Gate and measurement
/// failures are reported as `QrmError::GateFailure`, allocation failures as
/// `QrmError::OutOfMemory`.
pub trait StateBackend: Send + Sync {
    /// Allocates a state of `qubits` qubits in the all-zero basis state.
    fn alloc(&self, qubits: usize) -> Result<StateHandle>;

    /// Frees a state. Freeing an unknown handle is a no-op.
    fn free(&self, handle: StateHandle);

    /// Resets the state to the basis state encoding `value`.
    fn init(&self, handle: StateHandle, value: u64) -> Result<()>;

    /// Applies `gate` to `qubit` of `handle`, with an optional control qubit.
    fn apply_gate(
        &self,
        handle: StateHandle,
        gate: Gate,
        qubit: usize,
        control: Option<Control>,
    ) -> Result<()>;

    /// Measures every qubit of `src`, collapsing it, and stores the packed
    /// outcome in the classical register of `dst`.
    fn measure(&self, src: StateHandle, dst: StateHandle) -> Result<()>;

    /// Measures a single qubit and returns its outcome (0 or 1).
    fn measure_qubit(&self, handle: StateHandle, qubit: usize) -> Result<u8>;

    /// Reads the classical register of a state.
    fn get_value(&self, handle: StateHandle) -> Result<u64>;

    /// Number of qubits in the state.
    fn width(&self, handle: StateHandle) -> Result<usize>;
}

/// A state handle that is freed when dropped.
pub struct OwnedState {
    handle: StateHandle,
    qubits: usize,
    backend: Arc<dyn StateBackend>,
}

impl OwnedState {
    /// Allocates a fresh state from `backend`.
    pub fn alloc(backend: &Arc<dyn StateBackend>, qubits: usize) -> Result<Self> {
        let handle = backend.alloc(qubits)?;
        Ok(Self {
            handle,
            qubits,
            backend: Arc::clone(backend),
        })
    }

    /// Allocates a state and initializes it to `value`. The state is freed
    /// again if initialization fails.
    pub fn alloc_init(backend: &Arc<dyn StateBackend>, qubits: usize, value: u64) -> Result<Self> {
        let state = Self::alloc(backend, qubits)?;
        state.init(value)?;
        Ok(state)
    }

    /// Backend handle. Valid until this owner is dropped.
    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    /// Width the state was allocated with.
    pub fn qubits(&self) -> usize {
        self.qubits
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Resets the state to the basis state encoding `value`, qubit 0 in
    /// bit 0.
    pub fn init(&self, value: u64) -> Result<()> {
        self.backend.init(self.handle, value)
    }

    /// Applies `gate` to `qubit`. `control` is required for `Gate::Cnot`
    /// and rejected for every other gate.
    pub fn apply_gate(&self, gate: Gate, qubit: usize, control: Option<Control>) -> Result<()> {
        self.backend.apply_gate(self.handle, gate, qubit, control)
    }

    /// Measures one qubit, returning 0 or 1.
    pub fn measure_qubit(&self, qubit: usize) -> Result<u8> {
        self.backend.measure_qubit(self.handle, qubit)
    }

    /// Classical value last recorded in this state, such as the outcome a
    /// `measure` wrote into it.
    pub fn value(&self) -> Result<u64> {
        self.backend.get_value(self.handle)
    }
}

impl fmt::Debug for OwnedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedState")
            .field("handle", &self.handle)
            .field("qubits", &self.qubits)
            .finish()
    }
}

impl Drop for OwnedState {
    fn drop(&mut self) {
        self.backend.free(self.handle);
    }
}
