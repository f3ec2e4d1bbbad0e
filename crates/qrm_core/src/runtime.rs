//! Runtime context owning the backend, pool, engine and bridge.
//!
//! Components are built in dependency order by `Runtime::init` and torn down
//! in reverse by `Runtime::shutdown`: every block is destroyed first, then
//! the bridge interface state, then the engine registers.

use crate::bridge::ClassicalBridge;
use crate::correction::CorrectionEngine;
use crate::pool::BlockPool;
use crate::state::StateBackend;
use crate::{QrmError, Result};
use qrm_common::limits::{BUFFER_SIZE_DEFAULT, BUFFER_SIZE_MAX, BUFFER_SIZE_MIN, MAX_QUBITS};
use std::sync::Arc;
use tracing::info;

/// Settings applied when a runtime is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Initial pool ceiling in qubits.
    pub max_qubits: usize,

    /// Bridge buffer size in bytes, also the interface state width.
    pub buffer_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_qubits: MAX_QUBITS,
            buffer_capacity: BUFFER_SIZE_DEFAULT,
        }
    }
}

impl RuntimeConfig {
    /// Checks the settings without allocating anything.
    ///
    /// # Returns
    ///
    /// `InvalidArgument` if the pool ceiling is zero or the buffer capacity
    /// is outside `BUFFER_SIZE_MIN..=BUFFER_SIZE_MAX`.
    pub fn validate(&self) -> Result<()> {
        if self.max_qubits == 0 {
            return Err(QrmError::InvalidArgument("max_qubits must be positive".into()));
        }
        if !(BUFFER_SIZE_MIN..=BUFFER_SIZE_MAX).contains(&self.buffer_capacity) {
            return Err(QrmError::InvalidArgument(format!(
                "buffer capacity {} outside {BUFFER_SIZE_MIN}..={BUFFER_SIZE_MAX}",
                self.buffer_capacity
            )));
        }
        Ok(())
    }
}

/// An initialized allocator, correction engine and bridge sharing one
/// backend.
///
/// Fields are declared in teardown order, so dropping a runtime without
/// calling `shutdown` releases resources in the same order.
pub struct Runtime {
    pool: BlockPool,
    bridge: ClassicalBridge,
    engine: Arc<CorrectionEngine>,
    backend: Arc<dyn StateBackend>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Builds the pool, the correction engine and the bridge on `backend`.
    ///
    /// # Arguments
    ///
    /// * `config` - Pool ceiling and bridge capacity
    /// * `backend` - State backend shared by every component
    ///
    /// # Returns
    ///
    /// The runtime, or the first component error. Components built before
    /// the failure are released before returning.
    pub fn init(config: RuntimeConfig, backend: Arc<dyn StateBackend>) -> Result<Self> {
        config.validate()?;
        let engine = Arc::new(CorrectionEngine::new(Arc::clone(&backend))?);
        let bridge = ClassicalBridge::new(
            Arc::clone(&backend),
            Arc::clone(&engine),
            config.buffer_capacity,
        )?;
        let pool = BlockPool::new(config.max_qubits, Arc::clone(&backend));
        info!(
            max_qubits = config.max_qubits,
            buffer_capacity = config.buffer_capacity,
            "runtime initialized"
        );
        Ok(Self {
            pool,
            bridge,
            engine,
            backend,
            config,
        })
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn engine(&self) -> &CorrectionEngine {
        &self.engine
    }

    pub fn bridge(&self) -> &ClassicalBridge {
        &self.bridge
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    /// Destroys every block, then the bridge and engine states.
    ///
    /// Block handles still held by callers report `NullBlock` afterwards.
    pub fn shutdown(self) {
        let Runtime {
            pool,
            bridge,
            engine,
            ..
        } = self;
        let stats = pool.stats();
        pool.shutdown();
        drop(pool);
        drop(bridge);
        drop(engine);
        info!(total_qubits_ever = stats.total_qubits_ever, "runtime shut down");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("engine", &self.engine)
            .field("bridge", &self.bridge)
            .finish()
    }
}
