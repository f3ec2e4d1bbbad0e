//! Conversion between classical byte buffers and quantum states.
//!
//! The bridge owns an interface state with one qubit per byte of its
//! classical buffer. Encoding puts qubit `i` into superposition and adds a
//! phase when the low bit of byte `i` is set; decoding measures qubit `i`
//! into byte `i`. Both directions are all-or-nothing: encoding prepares a
//! scratch state and swaps it in only after every gate succeeded, and
//! decoding measures into a scratch buffer before copying out.

use crate::correction::{Correction, CorrectionEngine};
use crate::state::{OwnedState, StateBackend, StateHandle};
use crate::{QrmError, Result, lock};
use qrm_common::Gate;
use qrm_common::limits::{BUFFER_SIZE_MAX, BUFFER_SIZE_MIN};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Bridge counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    /// Successful `classical_to_quantum` calls.
    pub conversion_count: u64,
    /// Successful `quantum_to_classical` calls.
    pub measurement_count: u64,
}

struct BridgeState {
    interface: OwnedState,
    /// Input of the last successful conversion.
    buffer: Vec<u8>,
    stats: BridgeStats,
}

/// Classical/quantum glue around one interface state.
///
/// All operations take the bridge lock for their whole duration, so
/// conversions, readouts and controlled operations never interleave. A
/// controlled operation also takes the correction engine's lock while it
/// holds the bridge lock; nothing takes them in the opposite order.
///
/// # Examples
///
/// ```
/// use qrm_core::{ClassicalBridge, CorrectionEngine, FrameBackend, StateBackend};
/// use std::sync::Arc;
///
/// let backend: Arc<dyn StateBackend> = Arc::new(FrameBackend::new());
/// let engine = Arc::new(CorrectionEngine::new(backend.clone()).unwrap());
/// let bridge = ClassicalBridge::new(backend, engine, 64).unwrap();
///
/// bridge.classical_to_quantum(b"qrm").unwrap();
/// let mut out = [0u8; 3];
/// bridge.quantum_to_classical(&mut out).unwrap();
/// assert_eq!(bridge.stats().conversion_count, 1);
/// ```
pub struct ClassicalBridge {
    state: Mutex<BridgeState>,
    backend: Arc<dyn StateBackend>,
    engine: Arc<CorrectionEngine>,
    buffer_capacity: usize,
}

impl ClassicalBridge {
    /// Creates a bridge whose buffer and interface state hold
    /// `buffer_capacity` bytes and qubits.
    pub fn new(
        backend: Arc<dyn StateBackend>,
        engine: Arc<CorrectionEngine>,
        buffer_capacity: usize,
    ) -> Result<Self> {
        if !(BUFFER_SIZE_MIN..=BUFFER_SIZE_MAX).contains(&buffer_capacity) {
            return Err(QrmError::InvalidArgument(format!(
                "buffer capacity {buffer_capacity} outside {BUFFER_SIZE_MIN}..={BUFFER_SIZE_MAX}"
            )));
        }
        let interface = OwnedState::alloc_init(&backend, buffer_capacity, 0)?;
        Ok(Self {
            state: Mutex::new(BridgeState {
                interface,
                buffer: Vec::with_capacity(buffer_capacity),
                stats: BridgeStats::default(),
            }),
            backend,
            engine,
            buffer_capacity,
        })
    }

    /// Bytes the buffer holds, and qubits in the interface state.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Handle of the current interface state. The handle changes after every
    /// successful conversion.
    pub fn interface_handle(&self) -> StateHandle {
        lock(&self.state).interface.handle()
    }

    /// Rejects transfers longer than the buffer with `InvalidArgument`.
    ///
    /// Callers that size their own output buffer from untrusted input should
    /// check here before allocating it.
    pub fn check_len(&self, len: usize) -> Result<()> {
        if len > self.buffer_capacity {
            return Err(QrmError::InvalidArgument(format!(
                "{len} bytes exceed the {}-byte buffer",
                self.buffer_capacity
            )));
        }
        Ok(())
    }

    /// Encodes `data` into a fresh interface state.
    ///
    /// On failure the previous interface state and buffer are left as they
    /// were.
    pub fn classical_to_quantum(&self, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;

        let mut state = lock(&self.state);
        let scratch = OwnedState::alloc_init(&self.backend, self.buffer_capacity, 0)?;
        for (qubit, byte) in data.iter().enumerate() {
            scratch.apply_gate(Gate::H, qubit, None)?;
            if byte & 0x01 != 0 {
                scratch.apply_gate(Gate::Phase, qubit, None)?;
            }
        }

        state.interface = scratch;
        state.buffer.clear();
        state.buffer.extend_from_slice(data);
        state.stats.conversion_count += 1;
        debug!(bytes = data.len(), interface = %state.interface.handle(), "classical data encoded");
        Ok(())
    }

    /// Measures the first `out.len()` interface qubits into `out`, one
    /// outcome per byte. `out` is untouched on failure.
    pub fn quantum_to_classical(&self, out: &mut [u8]) -> Result<()> {
        self.check_len(out.len())?;

        let mut state = lock(&self.state);
        let outcomes = (0..out.len())
            .map(|qubit| state.interface.measure_qubit(qubit))
            .collect::<Result<Vec<u8>>>()?;
        out.copy_from_slice(&outcomes);
        state.stats.measurement_count += 1;
        Ok(())
    }

    /// Applies `gate` to an interface qubit and immediately runs a correction
    /// pass on the interface state. An empty `control_data` is rejected.
    pub fn controlled_operation(
        &self,
        gate: Gate,
        qubit: usize,
        control_data: &[u8],
    ) -> Result<Correction> {
        if control_data.is_empty() {
            return Err(QrmError::InvalidArgument("missing control data".into()));
        }
        if gate.is_controlled() {
            return Err(QrmError::InvalidArgument(format!(
                "{gate} cannot be driven by classical control"
            )));
        }
        if qubit >= self.buffer_capacity {
            return Err(QrmError::InvalidArgument(format!(
                "qubit {qubit} outside the {}-qubit interface",
                self.buffer_capacity
            )));
        }

        let state = lock(&self.state);
        state.interface.apply_gate(gate, qubit, None)?;
        self.engine.apply(state.interface.handle())
    }

    /// Snapshot of the conversion and measurement counters.
    pub fn stats(&self) -> BridgeStats {
        lock(&self.state).stats
    }

    /// Zeroes both counters. The interface state and buffer are kept.
    pub fn reset_stats(&self) {
        lock(&self.state).stats = BridgeStats::default();
    }

    /// Copy of the input of the last successful conversion.
    pub fn last_input(&self) -> Vec<u8> {
        lock(&self.state).buffer.clone()
    }
}

impl fmt::Debug for ClassicalBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassicalBridge")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBackend;
    use qrm_common::limits::BUFFER_SIZE_DEFAULT;

    fn bridge() -> (ClassicalBridge, Arc<FrameBackend>, Arc<CorrectionEngine>) {
        let backend = Arc::new(FrameBackend::new());
        let engine = Arc::new(CorrectionEngine::new(backend.clone()).unwrap());
        let bridge = ClassicalBridge::new(backend.clone(), engine.clone(), BUFFER_SIZE_MIN).unwrap();
        (bridge, backend, engine)
    }

    #[test]
    fn capacity_bounds_are_enforced() {
        let backend: Arc<dyn StateBackend> = Arc::new(FrameBackend::new());
        let engine = Arc::new(CorrectionEngine::new(backend.clone()).unwrap());
        assert!(ClassicalBridge::new(backend.clone(), engine.clone(), BUFFER_SIZE_MIN - 1).is_err());
        assert!(ClassicalBridge::new(backend.clone(), engine.clone(), BUFFER_SIZE_MAX + 1).is_err());
        let b = ClassicalBridge::new(backend, engine, BUFFER_SIZE_DEFAULT).unwrap();
        assert_eq!(b.buffer_capacity(), BUFFER_SIZE_DEFAULT);
    }

    #[test]
    fn oversized_buffers_are_invalid_arguments() {
        let (bridge, _, _) = bridge();
        let big = vec![0u8; BUFFER_SIZE_MIN + 1];
        assert!(matches!(bridge.classical_to_quantum(&big), Err(QrmError::InvalidArgument(_))));
        let mut out = vec![0u8; BUFFER_SIZE_MIN + 1];
        assert!(matches!(bridge.quantum_to_classical(&mut out), Err(QrmError::InvalidArgument(_))));
        assert_eq!(bridge.stats(), BridgeStats::default());
    }

    #[test]
    fn conversions_are_counted_and_old_state_freed() {
        let (bridge, backend, _) = bridge();
        let before = backend.live_states();
        bridge.classical_to_quantum(b"qubits").unwrap();
        bridge.classical_to_quantum(&[1, 0, 1]).unwrap();
        assert_eq!(backend.live_states(), before);
        let mut out = [9u8; 3];
        bridge.quantum_to_classical(&mut out).unwrap();
        assert_eq!(out, [0, 0, 0]);
        assert_eq!(
            bridge.stats(),
            BridgeStats {
                conversion_count: 2,
                measurement_count: 1
            }
        );
        assert_eq!(bridge.last_input(), vec![1, 0, 1]);
    }

    #[test]
    fn failed_conversion_keeps_previous_state() {
        let (bridge, backend, _) = bridge();
        bridge.classical_to_quantum(&[0, 0]).unwrap();
        let handle = bridge.interface_handle();
        backend.inject(handle, Gate::X, 5).unwrap();

        backend.fail_after(2);
        assert!(matches!(
            bridge.classical_to_quantum(&[1, 1, 1]),
            Err(QrmError::GateFailure(_))
        ));
        assert_eq!(bridge.interface_handle(), handle);
        assert_eq!(bridge.last_input(), vec![0, 0]);
        assert_eq!(bridge.stats().conversion_count, 1);

        let mut out = [0u8; 8];
        bridge.quantum_to_classical(&mut out).unwrap();
        assert_eq!(out[5], 1);
    }

    #[test]
    fn controlled_operation_corrects_afterwards() {
        let (bridge, _, engine) = bridge();
        assert_eq!(
            bridge.controlled_operation(Gate::X, 1, &[1]).unwrap(),
            Correction::BitFlip(1)
        );
        let mut out = [0u8; 3];
        bridge.quantum_to_classical(&mut out).unwrap();
        assert_eq!(out, [0, 0, 0]);
        assert_eq!(engine.counts(), (1, 1));
    }

    #[test]
    fn controlled_operation_on_qubit_two_follows_the_table() {
        let (bridge, _, _) = bridge();
        // an X on qubit 2 raises syndrome 4, which the table maps to a
        // phase flip on qubit 0, so the bit flip survives
        assert_eq!(
            bridge.controlled_operation(Gate::X, 2, &[1]).unwrap(),
            Correction::PhaseFlip(0)
        );
        let mut out = [0u8; 3];
        bridge.quantum_to_classical(&mut out).unwrap();
        assert_eq!(out, [0, 0, 1]);
    }

    #[test]
    fn controlled_operation_rejects_bad_input() {
        let (bridge, _, engine) = bridge();
        assert!(matches!(
            bridge.controlled_operation(Gate::X, 0, &[]),
            Err(QrmError::InvalidArgument(_))
        ));
        assert!(matches!(
            bridge.controlled_operation(Gate::Cnot, 0, &[1]),
            Err(QrmError::InvalidArgument(_))
        ));
        assert!(matches!(
            bridge.controlled_operation(Gate::X, BUFFER_SIZE_MIN, &[1]),
            Err(QrmError::InvalidArgument(_))
        ));
        assert_eq!(engine.counts(), (0, 0));
    }
}
