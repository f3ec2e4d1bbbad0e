//! Common definitions shared across the quantum resource manager.
//!
//! This crate provides the capacity limits of the qubit block pool, the gate
//! set understood by state backends and workload scripts, and the flag bits
//! carried by every memory block. It has no dependencies so that the core,
//! I/O and host crates agree on the same constants.

#![cfg_attr(not(test), no_std)]

use core::fmt;

/// Capacity limits for the block pool, the correction engine and the
/// quantum-classical bridge.
///
/// These are defaults and hard bounds; runtime configuration may lower the
/// pool ceiling but never raise a block above `MAX_QUBITS_PER_BLOCK`.
pub mod limits {
    /// Default ceiling on the total number of qubits held by in-use blocks.
    ///
    /// The ceiling can be changed at runtime, but never below the number of
    /// qubits currently allocated.
    pub const MAX_QUBITS: usize = 1024;

    /// Largest number of qubits a single block may hold.
    pub const MAX_QUBITS_PER_BLOCK: usize = 64;

    /// Width of the ancilla and syndrome registers used by the correction
    /// engine. Syndromes therefore fit in `0..(1 << ANCILLA_WIDTH)`.
    pub const ANCILLA_WIDTH: usize = 3;

    /// Smallest classical buffer the bridge accepts.
    pub const BUFFER_SIZE_MIN: usize = 64;

    /// Classical buffer size used when none is configured.
    pub const BUFFER_SIZE_DEFAULT: usize = 1024;

    /// Largest classical buffer the bridge accepts.
    pub const BUFFER_SIZE_MAX: usize = 8192;
}

/// Gate set shared by state backends, the correction engine and scripts.
pub mod isa {
    use core::fmt;

    /// Gates a state backend must be able to apply.
    ///
    /// The numeric values are stable so gates can be carried in compact
    /// binary records; the mnemonics are what workload scripts use.
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Gate {
        /// Hadamard. Puts a basis qubit into superposition.
        H = 0x01,

        /// Pauli X, a bit flip.
        X = 0x02,

        /// Pauli Y, a combined bit and phase flip.
        Y = 0x03,

        /// Pauli Z, a phase flip.
        Z = 0x04,

        /// Phase gate (S), a quarter turn about the Z axis.
        Phase = 0x05,

        /// Controlled NOT. Requires a control qubit, which may live in
        /// another state.
        Cnot = 0x10,
    }

    impl Gate {
        /// Every gate, in opcode order.
        pub const ALL: [Gate; 6] = [Gate::H, Gate::X, Gate::Y, Gate::Z, Gate::Phase, Gate::Cnot];

        /// Lowercase mnemonic used in scripts and logs.
        pub const fn mnemonic(self) -> &'static str {
            match self {
                Gate::H => "h",
                Gate::X => "x",
                Gate::Y => "y",
                Gate::Z => "z",
                Gate::Phase => "s",
                Gate::Cnot => "cnot",
            }
        }

        /// Looks up a gate by mnemonic. `phase` is accepted as an alias of `s`.
        pub fn from_mnemonic(name: &str) -> Option<Gate> {
            match name {
                "h" => Some(Gate::H),
                "x" => Some(Gate::X),
                "y" => Some(Gate::Y),
                "z" => Some(Gate::Z),
                "s" | "phase" => Some(Gate::Phase),
                "cnot" | "cx" => Some(Gate::Cnot),
                _ => None,
            }
        }

        /// Decodes a gate from its opcode.
        pub const fn from_u8(op: u8) -> Option<Gate> {
            match op {
                0x01 => Some(Gate::H),
                0x02 => Some(Gate::X),
                0x03 => Some(Gate::Y),
                0x04 => Some(Gate::Z),
                0x05 => Some(Gate::Phase),
                0x10 => Some(Gate::Cnot),
                _ => None,
            }
        }

        /// Whether the gate needs a control qubit.
        pub const fn is_controlled(self) -> bool {
            matches!(self, Gate::Cnot)
        }
    }

    impl fmt::Display for Gate {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.mnemonic())
        }
    }
}

/// Flag bits attached to memory blocks.
pub mod flags {
    use core::fmt;
    use core::ops::{BitOr, BitOrAssign};

    /// Set of block flags.
    ///
    /// Flags describe how a block may be used; the allocator stores them but
    /// only `ERROR_CORRECTABLE` and `ENTANGLED` change its behaviour.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockFlags(u8);

    impl BlockFlags {
        pub const NONE: BlockFlags = BlockFlags(0x00);
        /// The block may be passed to the correction engine.
        pub const ERROR_CORRECTABLE: BlockFlags = BlockFlags(0x01);
        /// The block's state has been coupled to another block.
        pub const ENTANGLED: BlockFlags = BlockFlags(0x02);
        /// The block should outlive individual operations.
        pub const PERSISTENT: BlockFlags = BlockFlags(0x04);
        /// The block may be referenced by more than one owner.
        pub const SHARED: BlockFlags = BlockFlags(0x08);

        const NAMED: [(BlockFlags, &'static str); 4] = [
            (BlockFlags::ERROR_CORRECTABLE, "ecc"),
            (BlockFlags::ENTANGLED, "entangled"),
            (BlockFlags::PERSISTENT, "persistent"),
            (BlockFlags::SHARED, "shared"),
        ];

        const MASK: u8 = 0x0F;

        pub const fn bits(self) -> u8 {
            self.0
        }

        /// Builds a flag set, dropping unknown bits.
        pub const fn from_bits_truncate(bits: u8) -> BlockFlags {
            BlockFlags(bits & Self::MASK)
        }

        pub const fn is_empty(self) -> bool {
            self.0 == 0
        }

        pub const fn contains(self, other: BlockFlags) -> bool {
            self.0 & other.0 == other.0
        }

        pub const fn union(self, other: BlockFlags) -> BlockFlags {
            BlockFlags(self.0 | other.0)
        }

        pub const fn difference(self, other: BlockFlags) -> BlockFlags {
            BlockFlags(self.0 & !other.0)
        }

        pub fn insert(&mut self, other: BlockFlags) {
            self.0 |= other.0;
        }

        pub fn remove(&mut self, other: BlockFlags) {
            self.0 &= !other.0;
        }

        /// Parses a single flag name (`ecc`, `entangled`, `persistent`,
        /// `shared`, or `none`).
        pub fn from_name(name: &str) -> Option<BlockFlags> {
            if name == "none" {
                return Some(BlockFlags::NONE);
            }
            Self::NAMED
                .iter()
                .find(|(_, n)| *n == name)
                .map(|(flag, _)| *flag)
        }
    }

    impl BitOr for BlockFlags {
        type Output = BlockFlags;

        fn bitor(self, rhs: BlockFlags) -> BlockFlags {
            self.union(rhs)
        }
    }

    impl BitOrAssign for BlockFlags {
        fn bitor_assign(&mut self, rhs: BlockFlags) {
            self.insert(rhs);
        }
    }

    impl fmt::Debug for BlockFlags {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "BlockFlags({self})")
        }
    }

    impl fmt::Display for BlockFlags {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.is_empty() {
                return f.write_str("none");
            }
            let mut first = true;
            for (flag, name) in Self::NAMED {
                if self.contains(flag) {
                    if !first {
                        f.write_str(",")?;
                    }
                    f.write_str(name)?;
                    first = false;
                }
            }
            Ok(())
        }
    }
}

pub use flags::BlockFlags;
pub use isa::Gate;

/// Identifier of a memory block, unique for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk#{}", self.0)
    }
}
