//! Pauli frame state backend.
//!
//! Models each state as a Pauli frame: two packed bit registers recording
//! whether each qubit carries an X or a Z error relative to the ideal
//! state, plus a classical value register for measurement results. Gates
//! update the registers by their conjugation rules on Pauli operators. This
//! is exact for the Clifford gates in the gate set and needs no amplitude
//! vectors, which keeps it deterministic and cheap enough for stress runs.

use crate::state::{Control, StateBackend, StateHandle};
use crate::{QrmError, Result, lock};
use qrm_common::Gate;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Bit helpers over packed `u64` words.
struct BitPack;

impl BitPack {
    #[inline(always)]
    fn get(storage: &[u64], index: usize) -> bool {
        (storage[index / 64] >> (index % 64)) & 1 == 1
    }

    #[inline(always)]
    fn toggle(storage: &mut [u64], index: usize) {
        storage[index / 64] ^= 1 << (index % 64);
    }

    #[inline(always)]
    fn set(storage: &mut [u64], index: usize, val: bool) {
        let mask = 1 << (index % 64);
        if val {
            storage[index / 64] |= mask;
        } else {
            storage[index / 64] &= !mask;
        }
    }
}

/// Pauli frame of a single state.
///
/// Bit `q` of `x_register` is set when qubit `q` carries an X error, bit `q`
/// of `z_register` when it carries a Z error. A qubit with both bits set
/// carries a Y error.
#[derive(Debug, Clone)]
struct PauliFrame {
    x_register: Vec<u64>,
    z_register: Vec<u64>,
    qubits: usize,

    /// Classical register written by `measure` and `init`.
    value: u64,
}

impl PauliFrame {
    fn new(qubits: usize) -> Self {
        let words = qubits.div_ceil(64);
        Self {
            x_register: vec![0; words],
            z_register: vec![0; words],
            qubits,
            value: 0,
        }
    }

    fn reset(&mut self) {
        self.x_register.fill(0);
        self.z_register.fill(0);
    }

    fn check(&self, qubit: usize) -> Result<()> {
        if qubit < self.qubits {
            Ok(())
        } else {
            Err(QrmError::GateFailure(format!(
                "qubit {qubit} out of range for {}-qubit state",
                self.qubits
            )))
        }
    }

    fn has_x(&self, q: usize) -> bool {
        BitPack::get(&self.x_register, q)
    }

    fn has_z(&self, q: usize) -> bool {
        BitPack::get(&self.z_register, q)
    }

    /// Applies a single-qubit gate. H swaps X and Z, S folds X into Z, and
    /// the Paulis toggle their own components.
    fn apply_single(&mut self, gate: Gate, q: usize) {
        match gate {
            Gate::H => {
                let has_x = self.has_x(q);
                let has_z = self.has_z(q);
                BitPack::set(&mut self.x_register, q, has_z);
                BitPack::set(&mut self.z_register, q, has_x);
            }
            Gate::X => BitPack::toggle(&mut self.x_register, q),
            Gate::Z => BitPack::toggle(&mut self.z_register, q),
            Gate::Y => {
                BitPack::toggle(&mut self.x_register, q);
                BitPack::toggle(&mut self.z_register, q);
            }
            Gate::Phase => {
                if self.has_x(q) {
                    BitPack::toggle(&mut self.z_register, q);
                }
            }
            Gate::Cnot => unreachable!("controlled gates are applied by the backend"),
        }
    }

    /// Packs the X bits of the first 64 qubits, qubit 0 in bit 0.
    fn packed_x(&self) -> u64 {
        self.x_register.first().copied().unwrap_or(0)
    }
}

/// Deterministic fault plan for exercising error paths.
#[derive(Debug, Default)]
struct FaultPlan {
    /// Gate applications left before the next one fails.
    gates_until_failure: Option<u64>,
}

#[derive(Debug, Default)]
struct FrameTable {
    states: HashMap<u64, PauliFrame>,
    next_id: u64,
    live_qubits: usize,
    faults: FaultPlan,
}

impl FrameTable {
    fn frame(&self, handle: StateHandle) -> Result<&PauliFrame> {
        self.states
            .get(&handle.0)
            .ok_or_else(|| QrmError::GateFailure(format!("unknown {handle}")))
    }

    fn frame_mut(&mut self, handle: StateHandle) -> Result<&mut PauliFrame> {
        self.states
            .get_mut(&handle.0)
            .ok_or_else(|| QrmError::GateFailure(format!("unknown {handle}")))
    }

    fn take_fault(&mut self) -> bool {
        match self.faults.gates_until_failure {
            Some(0) => {
                self.faults.gates_until_failure = None;
                true
            }
            Some(n) => {
                self.faults.gates_until_failure = Some(n - 1);
                false
            }
            None => false,
        }
    }

    /// CNOT conjugates X_c to X_c X_t and Z_t to Z_c Z_t: an X error on the
    /// control spreads to the target, a Z error on the target spreads back
    /// to the control.
    fn apply_cnot(&mut self, target: StateHandle, t: usize, control: Control) -> Result<()> {
        if control.handle == target && control.qubit == t {
            return Err(QrmError::GateFailure(format!(
                "cnot control and target are both qubit {t} of {target}"
            )));
        }
        let control_x = {
            let c = self.frame(control.handle)?;
            c.check(control.qubit)?;
            c.has_x(control.qubit)
        };
        let target_z = {
            let tf = self.frame(target)?;
            tf.check(t)?;
            tf.has_z(t)
        };
        if control_x {
            BitPack::toggle(&mut self.frame_mut(target)?.x_register, t);
        }
        if target_z {
            BitPack::toggle(&mut self.frame_mut(control.handle)?.z_register, control.qubit);
        }
        Ok(())
    }
}

/// State backend built on Pauli frames.
///
/// Holds every frame in one table behind a mutex. The backend is bounded
/// by a qubit capacity so allocation failures can be reproduced.
#[derive(Debug)]
pub struct FrameBackend {
    table: Mutex<FrameTable>,
    capacity: usize,
}

impl Default for FrameBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBackend {
    /// A backend with no practical capacity limit.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// A backend that refuses allocations once `capacity` qubits are live.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: Mutex::new(FrameTable::default()),
            capacity,
        }
    }

    /// Total qubits across live states.
    pub fn live_qubits(&self) -> usize {
        lock(&self.table).live_qubits
    }

    /// Number of live states.
    pub fn live_states(&self) -> usize {
        lock(&self.table).states.len()
    }

    /// Applies a Pauli error to a qubit without going through the fault plan.
    pub fn inject(&self, handle: StateHandle, gate: Gate, qubit: usize) -> Result<()> {
        if gate.is_controlled() {
            return Err(QrmError::InvalidArgument(format!(
                "cannot inject controlled gate {gate}"
            )));
        }
        let mut table = lock(&self.table);
        let frame = table.frame_mut(handle)?;
        frame.check(qubit)?;
        frame.apply_single(gate, qubit);
        debug!(%handle, %gate, qubit, "injected error");
        Ok(())
    }

    /// Makes the gate application after the next `gates` ones fail, once.
    pub fn fail_after(&self, gates: u64) {
        lock(&self.table).faults.gates_until_failure = Some(gates);
    }

    /// Whether a qubit currently carries an X error.
    pub fn has_x_error(&self, handle: StateHandle, qubit: usize) -> Result<bool> {
        let table = lock(&self.table);
        let frame = table.frame(handle)?;
        frame.check(qubit)?;
        Ok(frame.has_x(qubit))
    }

    /// Whether a qubit currently carries a Z error.
    pub fn has_z_error(&self, handle: StateHandle, qubit: usize) -> Result<bool> {
        let table = lock(&self.table);
        let frame = table.frame(handle)?;
        frame.check(qubit)?;
        Ok(frame.has_z(qubit))
    }
}

impl StateBackend for FrameBackend {
    fn alloc(&self, qubits: usize) -> Result<StateHandle> {
        if qubits == 0 {
            return Err(QrmError::InvalidArgument(
                "cannot allocate a zero-qubit state".into(),
            ));
        }
        let mut table = lock(&self.table);
        if table.live_qubits.saturating_add(qubits) > self.capacity {
            warn!(qubits, live = table.live_qubits, "frame backend exhausted");
            return Err(QrmError::OutOfMemory);
        }
        let id = table.next_id;
        table.next_id += 1;
        table.live_qubits += qubits;
        table.states.insert(id, PauliFrame::new(qubits));
        Ok(StateHandle(id))
    }

    fn free(&self, handle: StateHandle) {
        let mut table = lock(&self.table);
        if let Some(frame) = table.states.remove(&handle.0) {
            table.live_qubits -= frame.qubits;
        }
    }

    fn init(&self, handle: StateHandle, value: u64) -> Result<()> {
        let mut table = lock(&self.table);
        let frame = table.frame_mut(handle)?;
        frame.reset();
        for q in 0..frame.qubits.min(64) {
            if (value >> q) & 1 == 1 {
                BitPack::set(&mut frame.x_register, q, true);
            }
        }
        frame.value = value;
        Ok(())
    }

    fn apply_gate(
        &self,
        handle: StateHandle,
        gate: Gate,
        qubit: usize,
        control: Option<Control>,
    ) -> Result<()> {
        let mut table = lock(&self.table);
        if table.take_fault() {
            warn!(%handle, %gate, qubit, "injected gate fault");
            return Err(QrmError::GateFailure(format!(
                "injected fault applying {gate} to qubit {qubit} of {handle}"
            )));
        }
        match (gate, control) {
            (Gate::Cnot, Some(control)) => table.apply_cnot(handle, qubit, control),
            (Gate::Cnot, None) => Err(QrmError::GateFailure("cnot requires a control qubit".into())),
            (_, Some(_)) => Err(QrmError::GateFailure(format!(
                "gate {gate} does not take a control qubit"
            ))),
            (_, None) => {
                let frame = table.frame_mut(handle)?;
                frame.check(qubit)?;
                frame.apply_single(gate, qubit);
                Ok(())
            }
        }
    }

    fn measure(&self, src: StateHandle, dst: StateHandle) -> Result<()> {
        let mut table = lock(&self.table);
        table.frame(dst)?;
        let outcome = {
            let frame = table.frame_mut(src)?;
            let outcome = frame.packed_x();
            frame.reset();
            outcome
        };
        table.frame_mut(dst)?.value = outcome;
        Ok(())
    }

    fn measure_qubit(&self, handle: StateHandle, qubit: usize) -> Result<u8> {
        let table = lock(&self.table);
        let frame = table.frame(handle)?;
        frame.check(qubit)?;
        Ok(u8::from(frame.has_x(qubit)))
    }

    fn get_value(&self, handle: StateHandle) -> Result<u64> {
        Ok(lock(&self.table).frame(handle)?.value)
    }

    fn width(&self, handle: StateHandle) -> Result<usize> {
        Ok(lock(&self.table).frame(handle)?.qubits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hadamard_swaps_error_type() {
        let b = FrameBackend::new();
        let h = b.alloc(2).unwrap();
        b.inject(h, Gate::X, 1).unwrap();
        b.apply_gate(h, Gate::H, 1, None).unwrap();
        assert!(!b.has_x_error(h, 1).unwrap());
        assert!(b.has_z_error(h, 1).unwrap());
    }

    #[test]
    fn cnot_spreads_x_from_control_to_target() {
        let b = FrameBackend::new();
        let data = b.alloc(3).unwrap();
        let anc = b.alloc(3).unwrap();
        b.inject(data, Gate::X, 2).unwrap();
        for q in 0..3 {
            b.apply_gate(anc, Gate::Cnot, q, Some(Control::new(data, q))).unwrap();
        }
        assert_eq!(b.measure_qubit(anc, 2).unwrap(), 1);
        assert_eq!(b.measure_qubit(anc, 0).unwrap(), 0);

        let reg = b.alloc(3).unwrap();
        b.measure(anc, reg).unwrap();
        assert_eq!(b.get_value(reg).unwrap(), 0b100);
        // measurement collapses the source
        assert_eq!(b.measure_qubit(anc, 2).unwrap(), 0);
    }

    #[test]
    fn phase_turns_x_into_y() {
        let b = FrameBackend::new();
        let h = b.alloc(1).unwrap();
        b.inject(h, Gate::X, 0).unwrap();
        b.apply_gate(h, Gate::Phase, 0, None).unwrap();
        assert!(b.has_x_error(h, 0).unwrap());
        assert!(b.has_z_error(h, 0).unwrap());
    }

    #[test]
    fn capacity_and_free_accounting() {
        let b = FrameBackend::with_capacity(8);
        let a = b.alloc(5).unwrap();
        assert_eq!(b.alloc(4), Err(QrmError::OutOfMemory));
        b.free(a);
        assert_eq!(b.live_qubits(), 0);
        let c = b.alloc(8).unwrap();
        assert_eq!(b.width(c).unwrap(), 8);
        assert_eq!(b.live_states(), 1);
    }

    #[test]
    fn init_sets_basis_bits_and_value() {
        let b = FrameBackend::new();
        let h = b.alloc(4).unwrap();
        b.init(h, 0b1010).unwrap();
        assert_eq!(b.measure_qubit(h, 1).unwrap(), 1);
        assert_eq!(b.measure_qubit(h, 0).unwrap(), 0);
        assert_eq!(b.get_value(h).unwrap(), 0b1010);
    }

    #[test]
    fn fault_plan_fires_once() {
        let b = FrameBackend::new();
        let h = b.alloc(1).unwrap();
        b.fail_after(1);
        b.apply_gate(h, Gate::X, 0, None).unwrap();
        assert!(matches!(
            b.apply_gate(h, Gate::X, 0, None),
            Err(QrmError::GateFailure(_))
        ));
        b.apply_gate(h, Gate::X, 0, None).unwrap();
    }

    #[test]
    fn out_of_range_and_unknown_handles_fail() {
        let b = FrameBackend::new();
        let h = b.alloc(2).unwrap();
        assert!(matches!(b.apply_gate(h, Gate::H, 2, None), Err(QrmError::GateFailure(_))));
        assert!(matches!(
            b.apply_gate(StateHandle(99), Gate::H, 0, None),
            Err(QrmError::GateFailure(_))
        ));
        assert!(matches!(b.apply_gate(h, Gate::Cnot, 0, None), Err(QrmError::GateFailure(_))));
    }
}
