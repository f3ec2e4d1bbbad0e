//! Syndrome measurement and table-driven correction.
//!
//! The engine owns one ancilla register and one syndrome register, both
//! `ANCILLA_WIDTH` qubits wide, for its whole lifetime. Every `apply` call
//! couples data qubits 0..ANCILLA_WIDTH of the target state to the matching
//! ancilla qubits with CNOTs, measures the ancilla into the syndrome
//! register, and looks the syndrome up in a fixed table to pick at most one
//! corrective gate. The registers are a single shared resource, so `apply`
//! holds the engine lock from the first CNOT to the last correction gate and
//! concurrent calls serialize.
//!
//! A gate failure part way through syndrome extraction leaves the target
//! state partially coupled to the ancilla. Callers must treat the target as
//! indeterminate and reinitialize it rather than retry.

use crate::state::{Control, OwnedState, StateBackend, StateHandle};
use crate::{QrmError, Result, lock};
use qrm_common::Gate;
use qrm_common::limits::ANCILLA_WIDTH;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Corrective action selected by a syndrome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// No error detected.
    None,
    /// X on the given qubit.
    BitFlip(usize),
    /// Z on the given qubit.
    PhaseFlip(usize),
    /// Y on the given qubit.
    Combined(usize),
}

impl Correction {
    /// The gate and qubit this correction applies, if any.
    pub fn gate(self) -> Option<(Gate, usize)> {
        match self {
            Correction::None => None,
            Correction::BitFlip(q) => Some((Gate::X, q)),
            Correction::PhaseFlip(q) => Some((Gate::Z, q)),
            Correction::Combined(q) => Some((Gate::Y, q)),
        }
    }
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Correction::None => f.write_str("none"),
            Correction::BitFlip(q) => write!(f, "bit-flip q{q}"),
            Correction::PhaseFlip(q) => write!(f, "phase-flip q{q}"),
            Correction::Combined(q) => write!(f, "bit+phase-flip q{q}"),
        }
    }
}

/// Syndrome lookup table, indexed by syndrome value.
///
/// Syndrome 7 always targets qubit 0. A complete single-error table would
/// route it according to the qubit that raised it; this table does not.
const CORRECTION_TABLE: [Correction; 1 << ANCILLA_WIDTH] = [
    Correction::None,
    Correction::BitFlip(0),
    Correction::BitFlip(1),
    Correction::BitFlip(2),
    Correction::PhaseFlip(0),
    Correction::PhaseFlip(1),
    Correction::PhaseFlip(2),
    Correction::Combined(0),
];

/// Measured syndrome, always in `0..8`.
///
/// Bit `i` is set when position `i` of the target carried an X error at
/// extraction time. The value indexes the fixed correction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Syndrome(u8);

impl Syndrome {
    /// No error detected.
    pub const NONE: Syndrome = Syndrome(0);

    /// Returns `None` for values the ancilla register cannot produce.
    pub fn new(value: u8) -> Option<Syndrome> {
        (usize::from(value) < CORRECTION_TABLE.len()).then_some(Syndrome(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Looks up the corrective action for this syndrome.
    ///
    /// Values 1 to 3 map to bit flips and 4 to 6 to phase flips on qubits
    /// 0 to 2. Value 7 maps to `Combined(0)` whatever qubits raised it.
    pub fn correction(self) -> Correction {
        CORRECTION_TABLE[usize::from(self.0)]
    }
}

impl TryFrom<u64> for Syndrome {
    type Error = QrmError;

    /// Register values outside the table mean the backend misbehaved.
    fn try_from(value: u64) -> Result<Syndrome> {
        u8::try_from(value)
            .ok()
            .and_then(Syndrome::new)
            .ok_or_else(|| {
                QrmError::GateFailure(format!("syndrome register returned {value}, expected 0..8"))
            })
    }
}

/// Correction counters with the derived success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionStats {
    /// Syndrome measurements performed, including those that found no
    /// error. Not a count of detected errors.
    pub error_count: u64,
    /// Completed correction passes, including no-op passes.
    pub correction_count: u64,
    /// `correction_count * 100 / error_count`.
    pub success_rate: u64,
}

/// Engine state guarded by the engine lock.
struct EngineContext {
    ancilla: OwnedState,
    syndrome: OwnedState,
    error_count: u64,
    correction_count: u64,
}

/// The correction engine.
pub struct CorrectionEngine {
    context: Mutex<EngineContext>,
    backend: Arc<dyn StateBackend>,
}

impl CorrectionEngine {
    /// Allocates the ancilla and syndrome registers and sets both to zero.
    /// A register that was allocated before a later step failed is freed.
    pub fn new(backend: Arc<dyn StateBackend>) -> Result<Self> {
        let ancilla = OwnedState::alloc_init(&backend, ANCILLA_WIDTH, 0)?;
        let syndrome = OwnedState::alloc_init(&backend, ANCILLA_WIDTH, 0)?;
        debug!(ancilla = %ancilla.handle(), syndrome = %syndrome.handle(), "correction engine ready");
        Ok(Self {
            context: Mutex::new(EngineContext {
                ancilla,
                syndrome,
                error_count: 0,
                correction_count: 0,
            }),
            backend,
        })
    }

    /// Runs one syndrome measurement and correction pass on `state`.
    ///
    /// Returns the correction that was applied. The state must have at
    /// least `ANCILLA_WIDTH` qubits.
    pub fn apply(&self, state: StateHandle) -> Result<Correction> {
        let width = self.backend.width(state)?;
        if width < ANCILLA_WIDTH {
            return Err(QrmError::InvalidArgument(format!(
                "{state} has {width} qubits, correction needs {ANCILLA_WIDTH}"
            )));
        }

        let mut ctx = lock(&self.context);
        let syndrome = self.measure_syndrome(&mut ctx, state)?;
        let correction = syndrome.correction();
        if let Some((gate, qubit)) = correction.gate() {
            self.backend.apply_gate(state, gate, qubit, None)?;
        }
        ctx.correction_count += 1;
        debug!(%state, syndrome = syndrome.value(), %correction, "correction applied");
        Ok(correction)
    }

    /// Couples each low qubit of `state` into the ancilla and measures the
    /// ancilla into the syndrome register.
    ///
    /// The ancilla is cleared before coupling, and cleared again if a
    /// coupling gate fails, so an aborted pass never leaks a stale syndrome
    /// into the next one.
    fn measure_syndrome(&self, ctx: &mut EngineContext, state: StateHandle) -> Result<Syndrome> {
        let ancilla = ctx.ancilla.handle();
        ctx.ancilla.init(0)?;
        if let Err(e) = self.couple(ancilla, state) {
            if let Err(reset) = ctx.ancilla.init(0) {
                warn!(%ancilla, "ancilla reset failed: {reset}");
            }
            return Err(e);
        }
        self.backend.measure(ancilla, ctx.syndrome.handle())?;
        ctx.error_count += 1;
        Syndrome::try_from(self.backend.get_value(ctx.syndrome.handle())?)
    }

    fn couple(&self, ancilla: StateHandle, state: StateHandle) -> Result<()> {
        for qubit in 0..ANCILLA_WIDTH {
            self.backend
                .apply_gate(ancilla, Gate::Cnot, qubit, Some(Control::new(state, qubit)))?;
        }
        Ok(())
    }

    /// Counters and success rate. Fails with `DivideByZero` until at least
    /// one syndrome has been measured.
    pub fn get_stats(&self) -> Result<CorrectionStats> {
        let ctx = lock(&self.context);
        if ctx.error_count == 0 {
            return Err(QrmError::DivideByZero);
        }
        Ok(CorrectionStats {
            error_count: ctx.error_count,
            correction_count: ctx.correction_count,
            success_rate: ctx.correction_count * 100 / ctx.error_count,
        })
    }

    /// Raw `(error_count, correction_count)` without the derived rate.
    pub fn counts(&self) -> (u64, u64) {
        let ctx = lock(&self.context);
        (ctx.error_count, ctx.correction_count)
    }

    /// Zeroes both counters, so `get_stats` fails again until the next
    /// measurement.
    pub fn reset_stats(&self) {
        let mut ctx = lock(&self.context);
        ctx.error_count = 0;
        ctx.correction_count = 0;
    }
}

impl fmt::Debug for CorrectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (errors, corrections) = self.counts();
        f.debug_struct("CorrectionEngine")
            .field("error_count", &errors)
            .field("correction_count", &corrections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBackend;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Backend that records gates and reports a fixed syndrome.
    #[derive(Default)]
    struct ScriptedBackend {
        syndrome: u64,
        next: AtomicU64,
        gates: Mutex<Vec<(StateHandle, Gate, usize, Option<Control>)>>,
        fail_gate: Option<Gate>,
    }

    impl ScriptedBackend {
        fn reporting(syndrome: u64) -> Self {
            Self {
                syndrome,
                ..Self::default()
            }
        }

        fn gates(&self) -> Vec<(StateHandle, Gate, usize, Option<Control>)> {
            self.gates.lock().unwrap().clone()
        }
    }

    impl StateBackend for ScriptedBackend {
        fn alloc(&self, _qubits: usize) -> Result<StateHandle> {
            Ok(StateHandle(self.next.fetch_add(1, Ordering::Relaxed)))
        }
        fn free(&self, _handle: StateHandle) {}
        fn init(&self, _handle: StateHandle, _value: u64) -> Result<()> {
            Ok(())
        }
        fn apply_gate(
            &self,
            handle: StateHandle,
            gate: Gate,
            qubit: usize,
            control: Option<Control>,
        ) -> Result<()> {
            if self.fail_gate == Some(gate) {
                return Err(QrmError::GateFailure(format!("scripted {gate} failure")));
            }
            self.gates.lock().unwrap().push((handle, gate, qubit, control));
            Ok(())
        }
        fn measure(&self, _src: StateHandle, _dst: StateHandle) -> Result<()> {
            Ok(())
        }
        fn measure_qubit(&self, _handle: StateHandle, _qubit: usize) -> Result<u8> {
            Ok(0)
        }
        fn get_value(&self, _handle: StateHandle) -> Result<u64> {
            Ok(self.syndrome)
        }
        fn width(&self, _handle: StateHandle) -> Result<usize> {
            Ok(ANCILLA_WIDTH)
        }
    }

    #[test]
    fn table_matches_syndromes() {
        let expected = [
            Correction::None,
            Correction::BitFlip(0),
            Correction::BitFlip(1),
            Correction::BitFlip(2),
            Correction::PhaseFlip(0),
            Correction::PhaseFlip(1),
            Correction::PhaseFlip(2),
            Correction::Combined(0),
        ];
        for (value, correction) in expected.into_iter().enumerate() {
            assert_eq!(Syndrome::new(value as u8).unwrap().correction(), correction);
        }
        assert_eq!(Syndrome::new(8), None);
        assert!(matches!(Syndrome::try_from(9u64), Err(QrmError::GateFailure(_))));
    }

    #[test]
    fn syndrome_five_issues_one_phase_flip_on_qubit_one() {
        let backend = Arc::new(ScriptedBackend::reporting(5));
        let engine = CorrectionEngine::new(backend.clone()).unwrap();
        let target = StateHandle(100);

        assert_eq!(engine.apply(target).unwrap(), Correction::PhaseFlip(1));

        let on_target: Vec<_> = backend
            .gates()
            .into_iter()
            .filter(|(h, _, _, _)| *h == target)
            .collect();
        assert_eq!(on_target, vec![(target, Gate::Z, 1, None)]);
        assert_eq!(engine.counts(), (1, 1));
    }

    #[test]
    fn syndrome_extraction_couples_each_position() {
        let backend = Arc::new(ScriptedBackend::reporting(0));
        let engine = CorrectionEngine::new(backend.clone()).unwrap();
        let target = StateHandle(100);
        assert_eq!(engine.apply(target).unwrap(), Correction::None);

        let cnots: Vec<_> = backend
            .gates()
            .into_iter()
            .filter(|(_, g, _, _)| *g == Gate::Cnot)
            .map(|(_, _, q, c)| (q, c))
            .collect();
        assert_eq!(
            cnots,
            (0..ANCILLA_WIDTH)
                .map(|q| (q, Some(Control::new(target, q))))
                .collect::<Vec<_>>()
        );
        // syndrome 0 still counts as a measurement
        assert_eq!(engine.get_stats().unwrap().error_count, 1);
    }

    #[test]
    fn stats_before_any_measurement_divide_by_zero() {
        let engine = CorrectionEngine::new(Arc::new(ScriptedBackend::default())).unwrap();
        assert_eq!(engine.get_stats(), Err(QrmError::DivideByZero));
    }

    #[test]
    fn gate_failure_aborts_without_counting_a_correction() {
        let backend = Arc::new(ScriptedBackend {
            fail_gate: Some(Gate::Cnot),
            ..ScriptedBackend::reporting(1)
        });
        let engine = CorrectionEngine::new(backend).unwrap();
        assert!(matches!(engine.apply(StateHandle(7)), Err(QrmError::GateFailure(_))));
        assert_eq!(engine.counts(), (0, 0));
    }

    #[test]
    fn failed_correction_gate_counts_measurement_only() {
        let backend = Arc::new(ScriptedBackend {
            fail_gate: Some(Gate::X),
            ..ScriptedBackend::reporting(2)
        });
        let engine = CorrectionEngine::new(backend).unwrap();
        assert!(engine.apply(StateHandle(7)).is_err());
        let stats = engine.get_stats().unwrap();
        assert_eq!((stats.error_count, stats.correction_count, stats.success_rate), (1, 0, 0));
    }

    #[test]
    fn repairs_bit_flip_on_frame_backend() {
        let backend = Arc::new(FrameBackend::new());
        let engine = CorrectionEngine::new(backend.clone()).unwrap();
        let data = backend.alloc(3).unwrap();

        backend.inject(data, Gate::X, 1).unwrap();
        assert_eq!(engine.apply(data).unwrap(), Correction::BitFlip(1));
        assert!(!backend.has_x_error(data, 1).unwrap());

        // clean state measures syndrome 0 and the ancilla is reusable
        assert_eq!(engine.apply(data).unwrap(), Correction::None);
        let stats = engine.get_stats().unwrap();
        assert_eq!(stats.success_rate, 100);
    }

    #[test]
    fn aborted_coupling_leaves_no_stale_syndrome() {
        let backend = Arc::new(FrameBackend::new());
        let engine = CorrectionEngine::new(backend.clone()).unwrap();
        let noisy = backend.alloc(3).unwrap();
        let clean = backend.alloc(3).unwrap();
        backend.inject(noisy, Gate::X, 0).unwrap();

        // first cnot copies the flip into the ancilla, the second one fails
        backend.fail_after(1);
        assert!(matches!(engine.apply(noisy), Err(QrmError::GateFailure(_))));
        assert_eq!(engine.counts(), (0, 0));

        assert_eq!(engine.apply(clean).unwrap(), Correction::None);
        assert!(!backend.has_x_error(clean, 0).unwrap());
        assert_eq!(engine.apply(noisy).unwrap(), Correction::BitFlip(0));
        assert!(!backend.has_x_error(noisy, 0).unwrap());
    }

    #[test]
    fn narrow_state_is_rejected_before_coupling() {
        let backend = Arc::new(FrameBackend::new());
        let engine = CorrectionEngine::new(backend.clone()).unwrap();
        let narrow = backend.alloc(2).unwrap();
        assert!(matches!(engine.apply(narrow), Err(QrmError::InvalidArgument(_))));
        assert_eq!(engine.counts(), (0, 0));
    }

    #[test]
    fn registers_are_freed_with_the_engine() {
        let backend = Arc::new(FrameBackend::new());
        let engine = CorrectionEngine::new(backend.clone()).unwrap();
        assert_eq!(backend.live_states(), 2);
        drop(engine);
        assert_eq!(backend.live_states(), 0);
    }

    #[test]
    fn partial_register_allocation_is_released() {
        let backend = Arc::new(FrameBackend::with_capacity(ANCILLA_WIDTH));
        assert_eq!(
            CorrectionEngine::new(backend.clone()).unwrap_err(),
            QrmError::OutOfMemory
        );
        assert_eq!(backend.live_states(), 0);
    }
}
