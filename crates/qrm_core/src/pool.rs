//! Capacity-bounded qubit block allocator.
//!
//! The pool hands out memory blocks, each owning one backend state of a
//! fixed number of qubits. A single mutex guards the pool counters and the
//! in-use set, so the capacity check and the commit of an allocation happen
//! in one critical section and concurrent callers can never over-allocate.
//!
//! Blocks are reference counted explicitly. The count is decremented with a
//! compare-and-swap loop, and only the caller whose swap takes the count from
//! one to zero destroys the block. A count of zero is terminal: `acquire`
//! refuses to resurrect it, and every later operation reports `NullBlock`.

use crate::correction::{Correction, CorrectionEngine};
use crate::state::{Control, OwnedState, StateBackend, StateHandle};
use crate::{QrmError, Result, lock};
use qrm_common::limits::MAX_QUBITS_PER_BLOCK;
use qrm_common::{BlockFlags, BlockId, Gate};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Shared handle to a memory block.
pub type Block = Arc<MemoryBlock>;

/// A group of qubits managed as one resource.
///
/// Blocks are created by `BlockPool::allocate` with one reference and
/// destroyed when `BlockPool::release` drops the last one. A destroyed block
/// keeps its id, width and flags, so late holders of the `Arc` can still
/// report on it, but every operation that needs the backing state fails with
/// `QrmError::NullBlock`.
pub struct MemoryBlock {
    id: BlockId,
    qubit_count: usize,
    flags: AtomicU8,

    /// Outstanding references. Zero means destroyed.
    ref_count: AtomicUsize,

    /// Backing state; `None` once the block is destroyed.
    state: Mutex<Option<OwnedState>>,

    /// Caller-attached data, typed at the call site.
    private_data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl MemoryBlock {
    /// Pool-unique id, assigned at allocation and never reused.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Width of the block in qubits.
    pub fn qubit_count(&self) -> usize {
        self.qubit_count
    }

    /// Current flags. Bits outside the known set are dropped.
    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Adds `flags` to the block.
    pub fn set_flags(&self, flags: BlockFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Removes `flags` from the block.
    pub fn clear_flags(&self, flags: BlockFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Outstanding references.
    ///
    /// This is a snapshot: another thread may acquire or release between the
    /// read and any decision made on it. Use the return value of
    /// `BlockPool::release` to learn whether a release destroyed the block.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// A block is shared when it is flagged `SHARED` or more than one
    /// reference is outstanding.
    pub fn is_shared(&self) -> bool {
        self.flags().contains(BlockFlags::SHARED) || self.ref_count() > 1
    }

    /// Whether the block still holds at least one reference.
    pub fn is_live(&self) -> bool {
        self.ref_count() > 0
    }

    /// Attaches caller data to the block, replacing any previous value.
    pub fn set_private_data<T: Any + Send>(&self, data: T) {
        *lock(&self.private_data) = Some(Box::new(data));
    }

    /// Runs `f` on the attached data if it is a `T`.
    pub fn with_private_data<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = lock(&self.private_data);
        guard.as_deref_mut()?.downcast_mut::<T>().map(f)
    }

    /// Runs `f` with the block's live state.
    fn with_state<R>(&self, f: impl FnOnce(&OwnedState) -> Result<R>) -> Result<R> {
        let guard = lock(&self.state);
        match guard.as_ref() {
            Some(state) => f(state),
            None => Err(QrmError::NullBlock(self.id)),
        }
    }

    /// Backend handle of the block's live state.
    pub fn state_handle(&self) -> Result<StateHandle> {
        self.with_state(|s| Ok(s.handle()))
    }

    /// Resets the block's state to the basis state `value`.
    pub fn init_state(&self, value: u64) -> Result<()> {
        self.with_state(|s| s.init(value))
    }

    /// Applies a single-qubit gate to the block's state.
    pub fn apply_gate(&self, gate: Gate, qubit: usize) -> Result<()> {
        if gate.is_controlled() {
            return Err(QrmError::InvalidArgument(format!(
                "{gate} needs a control block, use entangle"
            )));
        }
        self.check_qubit(qubit)?;
        self.with_state(|s| s.apply_gate(gate, qubit, None))
    }

    /// Measures one qubit of the block.
    pub fn measure_qubit(&self, qubit: usize) -> Result<u8> {
        self.check_qubit(qubit)?;
        self.with_state(|s| s.measure_qubit(qubit))
    }

    /// Measures every qubit of the block at once.
    ///
    /// The outcomes are packed with qubit 0 in bit 0. The block's state
    /// collapses to the measured basis state, so a second measurement with
    /// no gates in between returns the same value. The scratch register the
    /// backend measures into is freed before returning.
    pub fn measure(&self) -> Result<u64> {
        self.with_state(|s| {
            let outcome = OwnedState::alloc(s.backend(), s.qubits())?;
            s.backend().measure(s.handle(), outcome.handle())?;
            let value = outcome.value()?;
            s.init(value)?;
            Ok(value)
        })
    }

    /// Couples qubit 0 of `self` (control) to qubit 0 of `other` (target)
    /// with a CNOT and marks both blocks `ENTANGLED`.
    pub fn entangle(&self, other: &MemoryBlock) -> Result<()> {
        if self.id == other.id {
            return Err(QrmError::InvalidArgument(format!(
                "cannot entangle {} with itself",
                self.id
            )));
        }
        // Lock in id order so opposite-direction entangles cannot deadlock.
        let (first, second) = if self.id < other.id {
            (self, other)
        } else {
            (other, self)
        };
        let first_guard = lock(&first.state);
        let second_guard = lock(&second.state);
        let first_state = first_guard.as_ref().ok_or(QrmError::NullBlock(first.id))?;
        let second_state = second_guard.as_ref().ok_or(QrmError::NullBlock(second.id))?;
        let (control, target) = if self.id < other.id {
            (first_state, second_state)
        } else {
            (second_state, first_state)
        };
        target.apply_gate(Gate::Cnot, 0, Some(Control::new(control.handle(), 0)))?;
        drop(second_guard);
        drop(first_guard);

        self.set_flags(BlockFlags::ENTANGLED);
        other.set_flags(BlockFlags::ENTANGLED);
        Ok(())
    }

    /// Swaps in a new backing state of the same width. The previous state
    /// is freed.
    pub fn replace_state(&self, new_state: OwnedState) -> Result<()> {
        if new_state.qubits() != self.qubit_count {
            return Err(QrmError::InvalidArgument(format!(
                "replacement state has {} qubits, {} holds {}",
                new_state.qubits(),
                self.id,
                self.qubit_count
            )));
        }
        let mut guard = lock(&self.state);
        match guard.as_mut() {
            Some(current) => {
                let old = std::mem::replace(current, new_state);
                drop(guard);
                drop(old);
                Ok(())
            }
            None => Err(QrmError::NullBlock(self.id)),
        }
    }

    /// Runs one correction pass on the block's state. Only blocks flagged
    /// `ERROR_CORRECTABLE` are accepted.
    pub fn correct(&self, engine: &CorrectionEngine) -> Result<Correction> {
        if !self.flags().contains(BlockFlags::ERROR_CORRECTABLE) {
            return Err(QrmError::InvalidArgument(format!(
                "{} is not flagged error-correctable",
                self.id
            )));
        }
        self.with_state(|s| engine.apply(s.handle()))
    }

    fn check_qubit(&self, qubit: usize) -> Result<()> {
        if qubit < self.qubit_count {
            Ok(())
        } else {
            Err(QrmError::InvalidArgument(format!(
                "qubit {qubit} out of range for {} ({} qubits)",
                self.id, self.qubit_count
            )))
        }
    }

    /// Increments the reference count unless the block is already destroyed.
    fn try_acquire(&self) -> Result<usize> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(QrmError::NullBlock(self.id));
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrements the reference count. Returns `true` for the single caller
    /// that took it from one to zero.
    fn try_release(&self) -> Result<bool> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(QrmError::NullBlock(self.id));
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current == 1),
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("id", &self.id)
            .field("qubit_count", &self.qubit_count)
            .field("flags", &self.flags())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Consistent snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Qubits ever handed out, never decremented.
    pub total_qubits_ever: u64,
    pub allocated_qubits: usize,
    pub max_qubits: usize,
    pub free_qubits: usize,
}

#[derive(Debug)]
struct PoolInner {
    max_qubits: usize,
    allocated_qubits: usize,
    total_qubits_ever: u64,
    in_use: BTreeMap<BlockId, Block>,
}

/// The block allocator.
pub struct BlockPool {
    inner: Mutex<PoolInner>,
    backend: Arc<dyn StateBackend>,
    next_id: AtomicU64,
}

impl BlockPool {
    /// Creates an empty pool with the given qubit ceiling.
    pub fn new(max_qubits: usize, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                max_qubits,
                allocated_qubits: 0,
                total_qubits_ever: 0,
                in_use: BTreeMap::new(),
            }),
            backend,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Allocates a block of `qubit_count` qubits with one reference.
    ///
    /// The capacity check, the backend allocation and the counter updates
    /// all happen under the pool lock. On any failure nothing is committed.
    pub fn allocate(&self, qubit_count: usize, flags: BlockFlags) -> Result<Block> {
        if qubit_count == 0 || qubit_count > MAX_QUBITS_PER_BLOCK {
            return Err(QrmError::InvalidSize {
                requested: qubit_count,
                max: MAX_QUBITS_PER_BLOCK,
            });
        }

        let mut inner = lock(&self.inner);
        let available = inner.max_qubits - inner.allocated_qubits;
        if qubit_count > available {
            warn!(requested = qubit_count, available, "block allocation refused");
            return Err(QrmError::CapacityExceeded {
                requested: qubit_count,
                available,
            });
        }

        let state = OwnedState::alloc(&self.backend, qubit_count)?;
        let id = BlockId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let block = Arc::new(MemoryBlock {
            id,
            qubit_count,
            flags: AtomicU8::new(flags.bits()),
            ref_count: AtomicUsize::new(1),
            state: Mutex::new(Some(state)),
            private_data: Mutex::new(None),
        });

        inner.in_use.insert(id, Arc::clone(&block));
        inner.allocated_qubits += qubit_count;
        inner.total_qubits_ever += qubit_count as u64;
        debug!(%id, qubit_count, %flags, allocated = inner.allocated_qubits, "block allocated");
        Ok(block)
    }

    /// Takes an additional reference on a live block.
    pub fn acquire(&self, block: &MemoryBlock) -> Result<()> {
        block.try_acquire().map(|_| ())
    }

    /// Drops one reference. The block is destroyed, and its state freed,
    /// when the last reference goes. Returns whether this call destroyed it.
    pub fn release(&self, block: &MemoryBlock) -> Result<bool> {
        if !block.try_release()? {
            return Ok(false);
        }
        let mut inner = lock(&self.inner);
        if inner.in_use.remove(&block.id).is_some() {
            inner.allocated_qubits -= block.qubit_count;
        }
        let state = lock(&block.state).take();
        drop(state);
        debug!(id = %block.id, allocated = inner.allocated_qubits, "block destroyed");
        Ok(true)
    }

    /// Changes the ceiling for future allocations. The ceiling may not drop
    /// below the qubits currently allocated.
    pub fn set_max_qubits(&self, max_qubits: usize) -> Result<()> {
        let mut inner = lock(&self.inner);
        if max_qubits < inner.allocated_qubits {
            return Err(QrmError::InvalidCapacity {
                requested: max_qubits,
                allocated: inner.allocated_qubits,
            });
        }
        inner.max_qubits = max_qubits;
        debug!(max_qubits, "pool ceiling updated");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = lock(&self.inner);
        PoolStats {
            total_qubits_ever: inner.total_qubits_ever,
            allocated_qubits: inner.allocated_qubits,
            max_qubits: inner.max_qubits,
            free_qubits: inner.max_qubits - inner.allocated_qubits,
        }
    }

    /// Number of in-use blocks.
    pub fn in_use(&self) -> usize {
        lock(&self.inner).in_use.len()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        lock(&self.inner).in_use.contains_key(&id)
    }

    /// Snapshot of the in-use blocks, ordered by id.
    pub fn blocks(&self) -> Vec<Block> {
        lock(&self.inner).in_use.values().cloned().collect()
    }

    /// Destroys every in-use block regardless of outstanding references.
    /// Handles held elsewhere observe `NullBlock` afterwards. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = lock(&self.inner);
        let blocks = std::mem::take(&mut inner.in_use);
        for block in blocks.values() {
            block.ref_count.store(0, Ordering::Release);
            let state = lock(&block.state).take();
            drop(state);
        }
        inner.allocated_qubits = 0;
        if !blocks.is_empty() {
            debug!(freed = blocks.len(), "pool shut down");
        }
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool").field("stats", &self.stats()).finish()
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
