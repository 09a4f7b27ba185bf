//! Reference-counted start/stop of the engine and the token every other
//! component uses to reach it.

use crate::engine::Engine;
use crate::error::{PresenceError, Result};
use crate::types::ServiceMode;
use parking_lot::{Mutex, MutexGuard};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Generation value meaning "no live engine".
const WITHDRAWN: u64 = 0;

/// The engine plus the state that decides whether it may be touched.
struct EngineCell {
    engine: Arc<dyn Engine>,
    /// Generation of the running engine, or `WITHDRAWN`.
    generation: AtomicU64,
    /// Serialises every access to the engine.
    serial: Mutex<()>,
}

impl EngineCell {
    fn activate(&self, generation: u64) {
        let _serial = self.serial.lock();
        self.generation.store(generation, Ordering::SeqCst);
    }

    /// Withdraw the engine. Waits for any in-flight access to finish.
    fn withdraw(&self) {
        let _serial = self.serial.lock();
        self.generation.store(WITHDRAWN, Ordering::SeqCst);
    }
}

/// Non-owning reference to the engine.
///
/// A token is tied to the engine generation that was running when it was
/// borrowed. Once that engine is torn down the token never resolves again,
/// even if the engine is started anew.
#[derive(Clone)]
pub struct LockToken {
    cell: Arc<EngineCell>,
    generation: u64,
}

impl LockToken {
    /// Lock the engine for use.
    ///
    /// Fails with [`PresenceError::LockUnavailable`] if the engine is gone.
    pub fn resolve(&self) -> Result<EngineAccess<'_>> {
        if self.generation == WITHDRAWN {
            return Err(PresenceError::LockUnavailable);
        }
        let serial = self.cell.serial.lock();
        if self.cell.generation.load(Ordering::SeqCst) != self.generation {
            return Err(PresenceError::LockUnavailable);
        }
        Ok(EngineAccess {
            _serial: serial,
            engine: &*self.cell.engine,
        })
    }

    /// Whether the engine this token refers to is still running.
    pub fn is_live(&self) -> bool {
        self.generation != WITHDRAWN
            && self.cell.generation.load(Ordering::SeqCst) == self.generation
    }
}

/// Exclusive access to a live engine, released on drop.
pub struct EngineAccess<'a> {
    _serial: MutexGuard<'a, ()>,
    engine: &'a dyn Engine,
}

impl<'a> Deref for EngineAccess<'a> {
    type Target = dyn Engine + 'a;

    fn deref(&self) -> &Self::Target {
        self.engine
    }
}

struct LifecycleState {
    count: usize,
    last_generation: u64,
}

/// Reference-counted start/stop of the engine.
///
/// The engine is initialised on the first `start` and torn down on the
/// matching last `stop`.
pub struct LifecycleGuard {
    mode: ServiceMode,
    cell: Arc<EngineCell>,
    state: Mutex<LifecycleState>,
}

impl LifecycleGuard {
    /// Create a guard over `engine` that runs it in `mode`.
    pub fn new(engine: Arc<dyn Engine>, mode: ServiceMode) -> Self {
        Self {
            mode,
            cell: Arc::new(EngineCell {
                engine,
                generation: AtomicU64::new(WITHDRAWN),
                serial: Mutex::new(()),
            }),
            state: Mutex::new(LifecycleState {
                count: 0,
                last_generation: WITHDRAWN,
            }),
        }
    }

    /// Start the subsystem, initialising the engine if this is the first
    /// start.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.count == 0 {
            self.cell
                .engine
                .start(self.mode)
                .map_err(|e| PresenceError::EngineInit(e.to_string()))?;
            state.last_generation += 1;
            self.cell.activate(state.last_generation);
            info!(mode = ?self.mode, generation = state.last_generation, "engine started");
        }
        state.count += 1;
        debug!(count = state.count, "lifecycle start");
        Ok(())
    }

    /// Stop the subsystem, tearing the engine down on the last stop.
    ///
    /// The count is decremented even if teardown reports a failure.
    pub fn stop(&self) -> Result<()> {
        self.stop_with(|| {})
    }

    /// Like [`stop`](Self::stop), running `before_teardown` on the last stop
    /// while the engine is still reachable.
    ///
    /// The hook runs under the lifecycle lock, so no concurrent `start` or
    /// `stop` can interleave with it. It must not call back into this guard.
    pub fn stop_with<F: FnOnce()>(&self, before_teardown: F) -> Result<()> {
        let mut state = self.state.lock();
        match state.count {
            0 => Err(PresenceError::NotStarted),
            1 => {
                before_teardown();
                state.count = 0;
                self.cell.withdraw();
                let result = self.teardown();
                info!(ok = result.is_ok(), "engine stopped");
                result
            }
            _ => {
                state.count -= 1;
                debug!(count = state.count, "lifecycle stop");
                Ok(())
            }
        }
    }

    /// Client side first, then server side.
    fn teardown(&self) -> Result<()> {
        let engine = &self.cell.engine;
        let mut failures = Vec::new();

        if self.mode.has_client() {
            if let Err(e) = engine.stop_client() {
                error!(error = %e, "client teardown failed");
                failures.push(format!("client: {}", e));
            }
        }
        if self.mode.has_server() {
            if let Err(e) = engine.stop_server() {
                error!(error = %e, "server teardown failed");
                failures.push(format!("server: {}", e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PresenceError::EngineTeardown(failures.join("; ")))
        }
    }

    /// Borrow a token for the engine. Resolve it at time of use.
    pub fn borrow_lock(&self) -> LockToken {
        LockToken {
            cell: Arc::clone(&self.cell),
            generation: self.cell.generation.load(Ordering::SeqCst),
        }
    }

    /// Whether the engine is currently initialised.
    pub fn is_running(&self) -> bool {
        self.state.lock().count > 0
    }

    /// Number of outstanding starts.
    pub fn start_count(&self) -> usize {
        self.state.lock().count
    }

    pub fn mode(&self) -> ServiceMode {
        self.mode
    }
}
