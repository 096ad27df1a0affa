//! Shared server state: admission accounting and lifecycle flags.
//!
//! One `ServerState` per daemon, shared by the accept loop, the
//! per-connection tasks, the signal task, and the local-attach worker.
//! All fields are atomics; a single [`Notify`] is the wake channel for
//! everything that changes the outcome of [`ServerState::should_exit`]
//! or [`ServerState::may_accept`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tracing::{info, warn};

pub struct ServerState {
    /// Connections currently being served.
    active_clients: AtomicUsize,
    /// Admission limit (`--shared`), fixed at startup, always >= 1.
    max_clients: usize,
    /// Set exactly once; never reverts.
    termination_requested: AtomicBool,
    /// Set once the first connection has been accepted.
    ever_accepted: AtomicBool,
    /// `--persistent`: keep serving after the last client leaves.
    persistent: bool,
    wake: Notify,
}

impl ServerState {
    pub fn new(max_clients: usize, persistent: bool) -> Self {
        debug_assert!(max_clients >= 1);
        Self {
            active_clients: AtomicUsize::new(0),
            max_clients,
            termination_requested: AtomicBool::new(false),
            ever_accepted: AtomicBool::new(false),
            persistent,
            wake: Notify::new(),
        }
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Acquire)
    }

    /// Whether a new connection may be admitted right now.
    pub fn may_accept(&self) -> bool {
        self.active_clients() < self.max_clients
    }

    /// Account for a connection that completed its accept.
    ///
    /// Called once per accepted connection, whether or not the gate was
    /// marginally exceeded in the window between the admission check and
    /// the accept itself; what was accepted is always counted.
    pub fn on_accepted(&self) {
        self.ever_accepted.store(true, Ordering::Release);
        self.active_clients.fetch_add(1, Ordering::AcqRel);
    }

    /// Account for a connection that terminated.
    ///
    /// A stray extra close is an internal inconsistency but must not take
    /// down a healthy server: the counter clamps at zero.
    pub fn on_closed(&self) {
        let underflow = self
            .active_clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err();
        if underflow {
            warn!("close notification with no active clients; ignoring");
        }
        self.wake.notify_waiters();
    }

    /// Request termination. Idempotent; the first call wins and wakes
    /// every waiter.
    ///
    /// Only touches one flag and the notifier, so it is safe to call from
    /// any task, including the signal-handling one.
    pub fn request_termination(&self) {
        if !self.termination_requested.swap(true, Ordering::AcqRel) {
            info!("termination requested");
        }
        self.wake.notify_waiters();
    }

    pub fn termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::Acquire)
    }

    /// The control loop's exit predicate.
    ///
    /// Without persistent mode the server is done once it has served at
    /// least one client and the client count is back to zero.
    pub fn should_exit(&self) -> bool {
        if self.termination_requested() {
            return true;
        }
        !self.persistent && self.ever_accepted.load(Ordering::Acquire) && self.active_clients() == 0
    }

    /// Block until [`should_exit`](Self::should_exit) holds.
    pub async fn wait_exit(&self) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Register before checking so a wake between the check and
            // the await is not lost.
            notified.as_mut().enable();
            if self.should_exit() {
                return;
            }
            notified.await;
        }
    }

    /// Block until termination has been requested.
    pub async fn terminated(&self) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.termination_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Block until an admission slot is free.
    ///
    /// Returns `false` if termination was requested first; the accept
    /// path must not re-arm in that case.
    pub async fn admission_ready(&self) -> bool {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.termination_requested() {
                return false;
            }
            if self.may_accept() {
                return true;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn admission_tracks_limit() {
        let state = ServerState::new(2, false);
        assert!(state.may_accept());
        state.on_accepted();
        assert!(state.may_accept());
        state.on_accepted();
        assert!(!state.may_accept());
        state.on_closed();
        assert!(state.may_accept());
        assert_eq!(state.active_clients(), 1);
    }

    #[test]
    fn stray_close_clamps_at_zero() {
        let state = ServerState::new(1, true);
        state.on_accepted();
        state.on_closed();
        state.on_closed();
        assert_eq!(state.active_clients(), 0);
        assert!(state.may_accept());
    }

    #[test]
    fn termination_is_idempotent() {
        let state = ServerState::new(1, true);
        assert!(!state.termination_requested());
        state.request_termination();
        state.request_termination();
        assert!(state.termination_requested());
        assert!(state.should_exit());
    }

    #[test]
    fn non_persistent_exits_when_drained() {
        let state = ServerState::new(4, false);
        // Never accepted: keep waiting.
        assert!(!state.should_exit());
        state.on_accepted();
        assert!(!state.should_exit());
        state.on_closed();
        assert!(state.should_exit());
    }

    #[test]
    fn persistent_ignores_drain() {
        let state = ServerState::new(4, true);
        state.on_accepted();
        state.on_closed();
        assert!(!state.should_exit());
        state.request_termination();
        assert!(state.should_exit());
    }

    #[tokio::test]
    async fn wait_exit_wakes_on_last_close() {
        let state = Arc::new(ServerState::new(1, false));
        state.on_accepted();

        let waiter = tokio::spawn({
            let state = Arc::clone(&state);
            async move { state.wait_exit().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.on_closed();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_exit should return after drain")
            .unwrap();
    }

    #[tokio::test]
    async fn admission_ready_aborts_on_termination() {
        let state = Arc::new(ServerState::new(1, true));
        state.on_accepted(); // gate now full

        let gate = tokio::spawn({
            let state = Arc::clone(&state);
            async move { state.admission_ready().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gate.is_finished());

        state.request_termination();
        let admitted = tokio::time::timeout(Duration::from_secs(1), gate)
            .await
            .expect("admission_ready should return on termination")
            .unwrap();
        assert!(!admitted);
    }

    #[tokio::test]
    async fn admission_ready_wakes_when_slot_frees() {
        let state = Arc::new(ServerState::new(1, true));
        state.on_accepted();

        let gate = tokio::spawn({
            let state = Arc::clone(&state);
            async move { state.admission_ready().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.on_closed();
        let admitted = tokio::time::timeout(Duration::from_secs(1), gate)
            .await
            .expect("admission_ready should return when a slot frees")
            .unwrap();
        assert!(admitted);
    }
}
