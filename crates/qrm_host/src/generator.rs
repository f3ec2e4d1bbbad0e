//! Random workload generator.
//!
//! Produces scripts that exercise every instruction while staying valid for
//! a runtime with the given pool ceiling: allocations always fit, corrected
//! blocks are flagged and wide enough, and every reference taken is released
//! before the script ends. The generator keeps its own model of slots and
//! capacity to guarantee this, so a generated script must run without errors.

use anyhow::{Context, Result, ensure};
use qrm_common::limits::{ANCILLA_WIDTH, BUFFER_SIZE_MIN, MAX_QUBITS_PER_BLOCK};
use qrm_common::{BlockFlags, Gate};
use qrm_core::vm::Instruction;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const SINGLE_QUBIT_GATES: [Gate; 5] = [Gate::H, Gate::X, Gate::Y, Gate::Z, Gate::Phase];

struct SlotModel {
    name: String,
    qubits: usize,
    correctable: bool,
    refs: usize,
}

struct WorkloadModel {
    slots: Vec<SlotModel>,
    next_slot: usize,
    allocated: usize,
    max_qubits: usize,
    ceiling: usize,
}

impl WorkloadModel {
    fn free(&self) -> usize {
        self.max_qubits - self.allocated
    }

    fn pick<'a>(&'a self, rng: &mut StdRng) -> Option<&'a SlotModel> {
        self.slots.choose(rng)
    }

    fn alloc(&mut self, rng: &mut StdRng) -> Option<Instruction> {
        let limit = self.free().min(MAX_QUBITS_PER_BLOCK);
        if limit == 0 {
            return None;
        }
        let qubits = rng.gen_range(1..=limit);
        let mut flags = BlockFlags::NONE;
        let correctable = qubits >= ANCILLA_WIDTH && rng.gen_bool(0.6);
        if correctable {
            flags.insert(BlockFlags::ERROR_CORRECTABLE);
        }
        if rng.gen_bool(0.2) {
            flags.insert(BlockFlags::PERSISTENT);
        }
        let name = format!("b{}", self.next_slot);
        self.next_slot += 1;
        self.allocated += qubits;
        self.slots.push(SlotModel {
            name: name.clone(),
            qubits,
            correctable,
            refs: 1,
        });
        Some(Instruction::Alloc {
            slot: name,
            qubits,
            flags,
        })
    }

    fn release(&mut self, index: usize) -> Instruction {
        let slot = &mut self.slots[index];
        slot.refs -= 1;
        let instr = Instruction::Release {
            slot: slot.name.clone(),
        };
        if slot.refs == 0 {
            self.allocated -= slot.qubits;
            self.slots.swap_remove(index);
        }
        instr
    }
}

fn printable(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len)
        .map(|_| loop {
            let b = rng.gen_range(b' '..=b'~');
            if b != b'"' && b != b'\\' {
                break b;
            }
        })
        .collect()
}

/// Builds a random workload of roughly `ops` instructions.
///
/// The returned program is `ops` instructions plus the releases needed to
/// drain every slot, and a final `stats`. A zero ceiling admits no blocks, so
/// the program is just `stats`.
pub fn workload(seed: u64, ops: usize, max_qubits: usize) -> Vec<Instruction> {
    if max_qubits == 0 {
        return vec![Instruction::Stats];
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = WorkloadModel {
        slots: Vec::new(),
        next_slot: 0,
        allocated: 0,
        max_qubits,
        ceiling: max_qubits,
    };
    let mut program = Vec::with_capacity(ops + 16);

    while program.len() < ops {
        let roll = rng.gen_range(0..100);
        let instr = if model.slots.is_empty() || roll < 20 {
            model.alloc(&mut rng)
        } else if roll < 32 {
            let index = rng.gen_range(0..model.slots.len());
            Some(model.release(index))
        } else if roll < 38 {
            model.pick(&mut rng).map(|s| Instruction::Acquire {
                slot: s.name.clone(),
            })
        } else if roll < 42 {
            model.pick(&mut rng).map(|s| Instruction::Init {
                slot: s.name.clone(),
                value: rng.gen_range(0..1u64 << s.qubits.min(63)),
            })
        } else if roll < 52 {
            model.pick(&mut rng).map(|s| Instruction::Gate {
                slot: s.name.clone(),
                gate: SINGLE_QUBIT_GATES[rng.gen_range(0..SINGLE_QUBIT_GATES.len())],
                qubit: rng.gen_range(0..s.qubits),
            })
        } else if roll < 56 && model.slots.len() >= 2 {
            let picked: Vec<_> = model.slots.choose_multiple(&mut rng, 2).collect();
            Some(Instruction::Entangle {
                a: picked[0].name.clone(),
                b: picked[1].name.clone(),
            })
        } else if roll < 72 {
            let correctable: Vec<_> = model.slots.iter().filter(|s| s.correctable).collect();
            correctable.choose(&mut rng).map(|s| {
                if rng.gen_bool(0.5) {
                    Instruction::Inject {
                        slot: s.name.clone(),
                        gate: [Gate::X, Gate::Z, Gate::Y][rng.gen_range(0..3)],
                        qubit: rng.gen_range(0..ANCILLA_WIDTH),
                    }
                } else {
                    Instruction::Correct {
                        slot: s.name.clone(),
                    }
                }
            })
        } else if roll < 80 {
            let len = rng.gen_range(0..=BUFFER_SIZE_MIN);
            let data = if rng.gen_bool(0.5) {
                printable(&mut rng, len)
            } else {
                (0..len).map(|_| rng.r#gen::<u8>()).collect()
            };
            Some(Instruction::Encode { data })
        } else if roll < 86 {
            Some(Instruction::Decode {
                len: rng.gen_range(1..=BUFFER_SIZE_MIN),
            })
        } else if roll < 92 {
            let len = rng.gen_range(1..=8);
            Some(Instruction::Control {
                gate: SINGLE_QUBIT_GATES[rng.gen_range(0..SINGLE_QUBIT_GATES.len())],
                qubit: rng.gen_range(0..BUFFER_SIZE_MIN),
                data: printable(&mut rng, len),
            })
        } else if roll < 96 {
            let qubits = rng.gen_range(model.allocated.max(1)..=model.ceiling.max(1));
            model.max_qubits = qubits;
            Some(Instruction::SetMax { qubits })
        } else {
            Some(Instruction::Stats)
        };
        if let Some(instr) = instr {
            program.push(instr);
        }
    }

    while !model.slots.is_empty() {
        let last = model.slots.len() - 1;
        program.push(model.release(last));
    }
    program.push(Instruction::Stats);
    program
}

/// Writes a generated workload script to `out`.
///
/// # Arguments
///
/// * `out` - Output script path
/// * `ops` - Number of random instructions before the final drain
/// * `seed` - RNG seed; equal seeds give identical scripts
/// * `max_qubits` - Pool ceiling the script must fit
pub fn generate_workload(out: &Path, ops: usize, seed: u64, max_qubits: usize) -> Result<()> {
    ensure!(max_qubits > 0, "max_qubits must be positive");
    let program = workload(seed, ops, max_qubits);
    let mut file = BufWriter::new(
        File::create(out).with_context(|| format!("Failed to create {}", out.display()))?,
    );
    writeln!(file, "# qrm gen --ops {ops} --seed {seed} --max-qubits {max_qubits}")?;
    for instr in &program {
        writeln!(file, "{instr}")?;
    }
    file.flush()?;
    println!("wrote {} instructions to {}", program.len(), out.display());
    Ok(())
}
