//! Whitebox kill points and sync points.
//!
//! The durability core is validated by crash tests that need to stop or
//! interleave execution at exact code locations. Two facilities provide
//! that:
//!
//! - **Kill points** — named locations that terminate the process (a
//!   clean `exit(0)`) when the armed name matches. Armed either through
//!   the `ROCKYARDKV_KILL_POINT` environment variable or the in-process
//!   [`arm_kill_point`] API. A test may register a callback for a name
//!   instead; the callback then runs in place of the exit, which lets
//!   in-process tests simulate the crash through the fault-injection
//!   filesystem.
//! - **Sync points** — named barriers. A test installs a callback for a
//!   name; execution reaching that point runs the callback (which may
//!   block on a channel to act as a barrier).
//!
//! Both live in a single process-scope registry: an atomic armed/enabled
//! flag for the fast path plus a name→callback table behind a mutex.
//! Production builds (no `crash-points` feature, outside `cfg(test)`)
//! compile [`kill_point`] and [`sync_point`] to empty inline functions, so
//! the call sites cost nothing.
//!
//! Point names are stable strings, e.g. `"Flush.WriteSST:0"` or
//! `"VersionSet::LogAndApply:Start"`; tests identify them by exact match.

#[cfg(any(test, feature = "crash-points"))]
mod enabled {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, OnceLock};

    use tracing::info;

    /// Callback invoked when an armed kill point or an installed sync
    /// point is reached.
    pub type PointCallback = Box<dyn Fn() + Send + Sync>;

    struct Registry {
        kill_armed: AtomicBool,
        kill: Mutex<KillState>,
        sync_enabled: AtomicBool,
        sync: Mutex<HashMap<String, PointCallback>>,
    }

    #[derive(Default)]
    struct KillState {
        armed_name: Option<String>,
        callbacks: HashMap<String, PointCallback>,
    }

    fn registry() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let armed_name = std::env::var("ROCKYARDKV_KILL_POINT")
                .ok()
                .filter(|name| !name.is_empty());
            let armed = armed_name.is_some();
            Registry {
                kill_armed: AtomicBool::new(armed),
                kill: Mutex::new(KillState {
                    armed_name,
                    callbacks: HashMap::new(),
                }),
                sync_enabled: AtomicBool::new(false),
                sync: Mutex::new(HashMap::new()),
            }
        })
    }

    /// Terminate (or run the registered callback) if `name` is armed.
    pub fn kill_point(name: &str) {
        let reg = registry();
        if !reg.kill_armed.load(Ordering::Acquire) {
            return;
        }
        let state = match reg.kill.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.armed_name.as_deref() != Some(name) {
            return;
        }
        if let Some(callback) = state.callbacks.get(name) {
            info!(point = name, "kill point hit, running registered callback");
            callback();
            return;
        }
        drop(state);
        info!(point = name, "kill point hit, exiting process");
        std::process::exit(0);
    }

    /// Run the registered callback for `name`, if any.
    pub fn sync_point(name: &str) {
        let reg = registry();
        if !reg.sync_enabled.load(Ordering::Acquire) {
            return;
        }
        let table = match reg.sync.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(callback) = table.get(name) {
            callback();
        }
    }

    /// Arm a kill point by name. Replaces any previously armed name.
    pub fn arm_kill_point(name: &str) {
        let reg = registry();
        let mut state = match reg.kill.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.armed_name = Some(name.to_string());
        reg.kill_armed.store(true, Ordering::Release);
    }

    /// Register a callback to run *instead of* process exit when the
    /// armed kill point `name` is reached.
    pub fn set_kill_callback(name: &str, callback: PointCallback) {
        let reg = registry();
        let mut state = match reg.kill.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.callbacks.insert(name.to_string(), callback);
    }

    /// Disarm the kill point and drop all kill callbacks.
    pub fn disarm_kill_points() {
        let reg = registry();
        let mut state = match reg.kill.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.armed_name = None;
        state.callbacks.clear();
        reg.kill_armed.store(false, Ordering::Release);
    }

    /// Install a sync-point callback and enable sync-point dispatch.
    pub fn set_sync_callback(name: &str, callback: PointCallback) {
        let reg = registry();
        let mut table = match reg.sync.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.insert(name.to_string(), callback);
        reg.sync_enabled.store(true, Ordering::Release);
    }

    /// Remove every sync-point callback and disable dispatch.
    pub fn clear_sync_callbacks() {
        let reg = registry();
        let mut table = match reg.sync.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.clear();
        reg.sync_enabled.store(false, Ordering::Release);
    }

    /// Serializes callers that arm, clear, or assert on the process-wide
    /// registry; tests take this so they cannot disturb one another.
    pub fn registry_guard() -> std::sync::MutexGuard<'static, ()> {
        static GUARD: Mutex<()> = Mutex::new(());
        GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(any(test, feature = "crash-points"))]
pub use enabled::{
    arm_kill_point, clear_sync_callbacks, disarm_kill_points, kill_point, registry_guard,
    set_kill_callback, set_sync_callback, sync_point, PointCallback,
};

// Production form: the whole registry compiles away and these calls
// inline to nothing.
#[cfg(not(any(test, feature = "crash-points")))]
#[inline(always)]
pub fn kill_point(_name: &str) {}

#[cfg(not(any(test, feature = "crash-points")))]
#[inline(always)]
pub fn sync_point(_name: &str) {}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
