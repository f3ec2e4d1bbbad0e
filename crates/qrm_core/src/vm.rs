//! Interpreter for workload instructions.
//!
//! A `Session` binds symbolic slot names to blocks and executes instructions
//! one at a time against a `Runtime`. Every instruction maps onto a single
//! allocator, engine or bridge operation, and its error is returned to the
//! caller unchanged; the session never retries.

use crate::bridge::BridgeStats;
use crate::correction::{Correction, CorrectionStats};
use crate::frame::FrameBackend;
use crate::pool::{Block, PoolStats};
use crate::runtime::Runtime;
use crate::{QrmError, Result};
use qrm_common::{BlockFlags, BlockId, Gate};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// A single workload operation.
///
/// The `Display` form is the script syntax accepted by the `qrm_io` parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Allocates a block and binds it to `slot`.
    Alloc {
        slot: String,
        qubits: usize,
        flags: BlockFlags,
    },
    /// Takes an additional reference on the block in `slot`.
    Acquire { slot: String },
    /// Drops one reference; the slot is forgotten when the block is destroyed.
    Release { slot: String },
    /// Resets the block's state to a basis value.
    Init { slot: String, value: u64 },
    /// Applies a single-qubit gate.
    Gate {
        slot: String,
        gate: Gate,
        qubit: usize,
    },
    /// CNOT from qubit 0 of `a` onto qubit 0 of `b`.
    Entangle { a: String, b: String },
    /// Applies an error outside the gate path. Needs the frame backend.
    Inject {
        slot: String,
        gate: Gate,
        qubit: usize,
    },
    /// One correction pass on the block in `slot`.
    Correct { slot: String },
    /// Encodes bytes into the bridge interface state.
    Encode { data: Vec<u8> },
    /// Measures `len` interface qubits.
    Decode { len: usize },
    /// Gate on an interface qubit followed by a correction pass.
    Control {
        gate: Gate,
        qubit: usize,
        data: Vec<u8>,
    },
    /// Changes the pool ceiling.
    SetMax { qubits: usize },
    /// Reports pool, engine and bridge counters.
    Stats,
}

/// Writes bytes as a quoted string when they are printable ASCII (or
/// empty), and as `0x` hex otherwise.
fn write_bytes(f: &mut fmt::Formatter<'_>, data: &[u8]) -> fmt::Result {
    let printable = data
        .iter()
        .all(|b| (b' '..=b'~').contains(b) && *b != b'"' && *b != b'\\');
    if printable {
        f.write_str("\"")?;
        for b in data {
            write!(f, "{}", *b as char)?;
        }
        f.write_str("\"")
    } else {
        f.write_str("0x")?;
        for b in data {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Alloc {
                slot,
                qubits,
                flags,
            } => {
                write!(f, "alloc {slot} {qubits}")?;
                if !flags.is_empty() {
                    write!(f, " {flags}")?;
                }
                Ok(())
            }
            Instruction::Acquire { slot } => write!(f, "acquire {slot}"),
            Instruction::Release { slot } => write!(f, "release {slot}"),
            Instruction::Init { slot, value } => write!(f, "init {slot} {value}"),
            Instruction::Gate { slot, gate, qubit } => write!(f, "gate {slot} {gate} {qubit}"),
            Instruction::Entangle { a, b } => write!(f, "entangle {a} {b}"),
            Instruction::Inject { slot, gate, qubit } => write!(f, "inject {slot} {gate} {qubit}"),
            Instruction::Correct { slot } => write!(f, "correct {slot}"),
            Instruction::Encode { data } => {
                f.write_str("encode ")?;
                write_bytes(f, data)
            }
            Instruction::Decode { len } => write!(f, "decode {len}"),
            Instruction::Control { gate, qubit, data } => {
                write!(f, "control {gate} {qubit} ")?;
                write_bytes(f, data)
            }
            Instruction::SetMax { qubits } => write!(f, "setmax {qubits}"),
            Instruction::Stats => f.write_str("stats"),
        }
    }
}

/// Result of executing one instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A block was allocated and bound to `slot`.
    Allocated {
        slot: String,
        id: BlockId,
        qubits: usize,
    },
    /// Reference count after an acquire or a non-final release.
    RefCount { slot: String, ref_count: usize },
    /// The last reference was released and the slot unbound.
    Destroyed { slot: String, id: BlockId },
    /// `None` for bridge controlled operations.
    Corrected {
        slot: Option<String>,
        correction: Correction,
    },
    /// One outcome (0 or 1) per decoded interface qubit.
    Decoded(Vec<u8>),
    /// Counters of every subsystem at the time of the `stats` instruction.
    Stats {
        pool: PoolStats,
        /// `None` until the engine has measured a syndrome.
        engine: Option<CorrectionStats>,
        bridge: BridgeStats,
    },
    /// The instruction succeeded and has nothing to report.
    Done,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Allocated { slot, id, qubits } => {
                write!(f, "{slot} = {id} ({qubits} qubits)")
            }
            Outcome::RefCount { slot, ref_count } => write!(f, "{slot} refs={ref_count}"),
            Outcome::Destroyed { slot, id } => write!(f, "{slot} ({id}) destroyed"),
            Outcome::Corrected {
                slot: Some(slot),
                correction,
            } => write!(f, "{slot} corrected: {correction}"),
            Outcome::Corrected {
                slot: None,
                correction,
            } => write!(f, "interface corrected: {correction}"),
            Outcome::Decoded(bits) => {
                f.write_str("decoded ")?;
                for b in bits {
                    write!(f, "{b}")?;
                }
                Ok(())
            }
            Outcome::Stats {
                pool,
                engine,
                bridge,
            } => {
                write!(
                    f,
                    "pool allocated={} free={} max={} total_ever={}",
                    pool.allocated_qubits, pool.free_qubits, pool.max_qubits, pool.total_qubits_ever
                )?;
                match engine {
                    Some(e) => write!(
                        f,
                        "; engine measured={} corrected={} success={}%",
                        e.error_count, e.correction_count, e.success_rate
                    )?,
                    None => f.write_str("; engine idle")?,
                }
                write!(
                    f,
                    "; bridge conversions={} measurements={}",
                    bridge.conversion_count, bridge.measurement_count
                )
            }
            Outcome::Done => f.write_str("ok"),
        }
    }
}

/// Executes instructions against a runtime.
///
/// The session borrows the runtime, so the runtime cannot be shut down
/// while slots still refer to its blocks.
pub struct Session<'rt> {
    runtime: &'rt Runtime,

    /// Slot name to block, for blocks the session has not fully released.
    slots: BTreeMap<String, Block>,

    /// Frame backend used by `Inject`, when the runtime runs on one.
    injector: Option<Arc<FrameBackend>>,
}

impl<'rt> Session<'rt> {
    /// Starts a session with no bound slots and no injector.
    pub fn new(runtime: &'rt Runtime) -> Self {
        Self {
            runtime,
            slots: BTreeMap::new(),
            injector: None,
        }
    }

    /// Enables `Inject` instructions. `frame` must be the backend the
    /// runtime was initialized with.
    pub fn with_injector(mut self, frame: Arc<FrameBackend>) -> Self {
        self.injector = Some(frame);
        self
    }

    /// Block bound to `slot`, if any.
    pub fn block(&self, slot: &str) -> Option<&Block> {
        self.slots.get(slot)
    }

    /// Bound slot names, sorted.
    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    fn slot(&self, slot: &str) -> Result<&Block> {
        self.slots
            .get(slot)
            .ok_or_else(|| QrmError::InvalidArgument(format!("unknown slot `{slot}`")))
    }

    /// Executes a single instruction.
    ///
    /// # Arguments
    ///
    /// * `instr` - Instruction to execute
    ///
    /// # Returns
    ///
    /// The outcome on success, or the error of the underlying allocator,
    /// engine or bridge operation. Slot names that are unknown, or already
    /// bound for `Alloc`, are reported as `InvalidArgument`.
    pub fn execute(&mut self, instr: &Instruction) -> Result<Outcome> {
        trace!(%instr, "execute");
        let rt = self.runtime;
        let outcome = match instr {
            Instruction::Alloc {
                slot,
                qubits,
                flags,
            } => {
                if self.slots.contains_key(slot) {
                    return Err(QrmError::InvalidArgument(format!(
                        "slot `{slot}` is already bound"
                    )));
                }
                let block = rt.pool().allocate(*qubits, *flags)?;
                let id = block.id();
                self.slots.insert(slot.clone(), block);
                Outcome::Allocated {
                    slot: slot.clone(),
                    id,
                    qubits: *qubits,
                }
            }
            Instruction::Acquire { slot } => {
                let block = self.slot(slot)?;
                rt.pool().acquire(block)?;
                Outcome::RefCount {
                    slot: slot.clone(),
                    ref_count: block.ref_count(),
                }
            }
            Instruction::Release { slot } => {
                let block = self.slot(slot)?;
                if rt.pool().release(block)? {
                    let id = block.id();
                    self.slots.remove(slot);
                    Outcome::Destroyed {
                        slot: slot.clone(),
                        id,
                    }
                } else {
                    Outcome::RefCount {
                        slot: slot.clone(),
                        ref_count: block.ref_count(),
                    }
                }
            }
            Instruction::Init { slot, value } => {
                self.slot(slot)?.init_state(*value)?;
                Outcome::Done
            }
            Instruction::Gate { slot, gate, qubit } => {
                self.slot(slot)?.apply_gate(*gate, *qubit)?;
                Outcome::Done
            }
            Instruction::Entangle { a, b } => {
                self.slot(a)?.entangle(self.slot(b)?)?;
                Outcome::Done
            }
            Instruction::Inject { slot, gate, qubit } => {
                let frame = self.injector.as_ref().ok_or_else(|| {
                    QrmError::InvalidArgument("error injection needs the frame backend".into())
                })?;
                let handle = self.slot(slot)?.state_handle()?;
                frame.inject(handle, *gate, *qubit)?;
                Outcome::Done
            }
            Instruction::Correct { slot } => {
                let correction = self.slot(slot)?.correct(rt.engine())?;
                Outcome::Corrected {
                    slot: Some(slot.clone()),
                    correction,
                }
            }
            Instruction::Encode { data } => {
                rt.bridge().classical_to_quantum(data)?;
                Outcome::Done
            }
            Instruction::Decode { len } => {
                rt.bridge().check_len(*len)?;
                let mut out = vec![0u8; *len];
                rt.bridge().quantum_to_classical(&mut out)?;
                Outcome::Decoded(out)
            }
            Instruction::Control { gate, qubit, data } => {
                let correction = rt.bridge().controlled_operation(*gate, *qubit, data)?;
                Outcome::Corrected {
                    slot: None,
                    correction,
                }
            }
            Instruction::SetMax { qubits } => {
                rt.pool().set_max_qubits(*qubits)?;
                Outcome::Done
            }
            Instruction::Stats => Outcome::Stats {
                pool: rt.pool().stats(),
                engine: rt.engine().get_stats().ok(),
                bridge: rt.bridge().stats(),
            },
        };
        debug!(%instr, %outcome, "executed");
        Ok(outcome)
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .field("injector", &self.injector.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use qrm_common::limits::BUFFER_SIZE_MIN;

    fn runtime(max_qubits: usize) -> (Runtime, Arc<FrameBackend>) {
        let backend = Arc::new(FrameBackend::new());
        let config = RuntimeConfig {
            max_qubits,
            buffer_capacity: BUFFER_SIZE_MIN,
        };
        (Runtime::init(config, backend.clone()).unwrap(), backend)
    }

    fn alloc(slot: &str, qubits: usize, flags: BlockFlags) -> Instruction {
        Instruction::Alloc {
            slot: slot.into(),
            qubits,
            flags,
        }
    }

    #[test]
    fn inject_and_correct_a_block() {
        let (rt, frame) = runtime(64);
        let mut s = Session::new(&rt).with_injector(frame);
        s.execute(&alloc("q", 3, BlockFlags::ERROR_CORRECTABLE)).unwrap();
        s.execute(&Instruction::Inject {
            slot: "q".into(),
            gate: Gate::X,
            qubit: 0,
        })
        .unwrap();
        assert_eq!(
            s.execute(&Instruction::Correct { slot: "q".into() }).unwrap(),
            Outcome::Corrected {
                slot: Some("q".into()),
                correction: Correction::BitFlip(0)
            }
        );
        match s.execute(&Instruction::Stats).unwrap() {
            Outcome::Stats { pool, engine, .. } => {
                assert_eq!(pool.allocated_qubits, 3);
                assert_eq!(engine.map(|e| e.success_rate), Some(100));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn release_to_zero_unbinds_the_slot() {
        let (rt, _) = runtime(64);
        let mut s = Session::new(&rt);
        s.execute(&alloc("a", 2, BlockFlags::NONE)).unwrap();
        assert_eq!(
            s.execute(&Instruction::Acquire { slot: "a".into() }).unwrap(),
            Outcome::RefCount {
                slot: "a".into(),
                ref_count: 2
            }
        );
        s.execute(&Instruction::Release { slot: "a".into() }).unwrap();
        assert!(matches!(
            s.execute(&Instruction::Release { slot: "a".into() }).unwrap(),
            Outcome::Destroyed { .. }
        ));
        assert!(s.block("a").is_none());
        assert_eq!(rt.pool().stats().allocated_qubits, 0);
        assert!(matches!(
            s.execute(&Instruction::Release { slot: "a".into() }),
            Err(QrmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn slot_names_are_unique_while_bound() {
        let (rt, _) = runtime(64);
        let mut s = Session::new(&rt);
        s.execute(&alloc("a", 1, BlockFlags::NONE)).unwrap();
        assert!(s.execute(&alloc("a", 1, BlockFlags::NONE)).is_err());
        assert_eq!(rt.pool().stats().allocated_qubits, 1);
        assert_eq!(s.slots().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn allocator_errors_pass_through() {
        let (rt, _) = runtime(4);
        let mut s = Session::new(&rt);
        assert!(matches!(
            s.execute(&alloc("big", 5, BlockFlags::NONE)),
            Err(QrmError::CapacityExceeded {
                requested: 5,
                available: 4
            })
        ));
        s.execute(&alloc("a", 4, BlockFlags::NONE)).unwrap();
        assert!(matches!(
            s.execute(&Instruction::SetMax { qubits: 3 }),
            Err(QrmError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn oversized_decode_is_rejected_before_allocating() {
        let (rt, _) = runtime(8);
        let mut s = Session::new(&rt);
        for len in [BUFFER_SIZE_MIN + 1, usize::MAX / 2, usize::MAX] {
            assert!(matches!(
                s.execute(&Instruction::Decode { len }),
                Err(QrmError::InvalidArgument(_))
            ));
        }
        assert_eq!(rt.bridge().stats().measurement_count, 0);
        assert!(matches!(
            s.execute(&Instruction::Decode { len: BUFFER_SIZE_MIN }),
            Ok(Outcome::Decoded(bits)) if bits.len() == BUFFER_SIZE_MIN
        ));
    }

    #[test]
    fn inject_without_frame_backend_is_rejected() {
        let (rt, _) = runtime(8);
        let mut s = Session::new(&rt);
        s.execute(&alloc("a", 3, BlockFlags::NONE)).unwrap();
        assert!(matches!(
            s.execute(&Instruction::Inject {
                slot: "a".into(),
                gate: Gate::Z,
                qubit: 0
            }),
            Err(QrmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn entangle_then_decode_the_interface() {
        let (rt, _) = runtime(16);
        let mut s = Session::new(&rt);
        s.execute(&alloc("a", 2, BlockFlags::NONE)).unwrap();
        s.execute(&alloc("b", 2, BlockFlags::NONE)).unwrap();
        s.execute(&Instruction::Init {
            slot: "a".into(),
            value: 1,
        })
        .unwrap();
        s.execute(&Instruction::Entangle {
            a: "a".into(),
            b: "b".into(),
        })
        .unwrap();
        assert_eq!(rt.pool().stats().allocated_qubits, 4);
        assert!(s.block("b").unwrap().flags().contains(BlockFlags::ENTANGLED));
        assert_eq!(s.block("b").unwrap().measure_qubit(0).unwrap(), 1);

        s.execute(&Instruction::Control {
            gate: Gate::X,
            qubit: 1,
            data: vec![1],
        })
        .unwrap();
        assert_eq!(
            s.execute(&Instruction::Decode { len: 2 }).unwrap(),
            Outcome::Decoded(vec![0, 0])
        );
    }

    #[test]
    fn display_uses_script_syntax() {
        assert_eq!(
            alloc("q0", 5, BlockFlags::ERROR_CORRECTABLE | BlockFlags::SHARED).to_string(),
            "alloc q0 5 ecc,shared"
        );
        assert_eq!(alloc("q0", 5, BlockFlags::NONE).to_string(), "alloc q0 5");
        assert_eq!(
            Instruction::Encode {
                data: b"hi".to_vec()
            }
            .to_string(),
            "encode \"hi\""
        );
        assert_eq!(
            Instruction::Control {
                gate: Gate::Phase,
                qubit: 3,
                data: vec![0, 0xff]
            }
            .to_string(),
            "control s 3 0x00ff"
        );
    }
}
