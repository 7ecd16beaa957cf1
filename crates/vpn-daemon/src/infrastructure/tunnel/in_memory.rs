//! In-memory tunnel backend for `--dry-run` and tests.
//!
//! Nothing touches the network.  Tests script the outcome of each establish
//! call, hold establish calls at a gate to observe `Connecting`, and inject
//! unsolicited drops through [`InMemoryTunnel::drop_tunnel`].

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use vpn_core::{RelayConfig, TunnelError, TunnelHandle};

use crate::application::tunnel_control::{TunnelCapability, TunnelEvent};

#[derive(Default)]
struct State {
    scripted: VecDeque<Result<(), TunnelError>>,
    active: HashSet<TunnelHandle>,
    establish_calls: Vec<RelayConfig>,
    teardown_calls: Vec<TunnelHandle>,
}

pub struct InMemoryTunnel {
    state: Mutex<State>,
    next_handle: AtomicU64,
    /// `true` while establish calls may proceed.
    gate: watch::Sender<bool>,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl InMemoryTunnel {
    /// Creates the backend and the event stream to hand to the manager.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TunnelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (gate, _) = watch::channel(true);
        let tunnel = Self {
            state: Mutex::new(State::default()),
            next_handle: AtomicU64::new(1),
            gate,
            events,
        };
        (tunnel, rx)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the outcome of a future establish call.  Calls beyond the
    /// queue succeed.
    pub fn push_result(&self, result: Result<(), TunnelError>) {
        self.lock().scripted.push_back(result);
    }

    /// Holds every establish call until [`resume_establish`](Self::resume_establish).
    pub fn pause_establish(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume_establish(&self) {
        self.gate.send_replace(true);
    }

    /// Reports the tunnel as dropped, as the OS would.
    pub fn drop_tunnel(&self, handle: TunnelHandle, reason: &str, recoverable: bool) {
        self.lock().active.remove(&handle);
        let _ = self.events.send(TunnelEvent::Dropped {
            handle,
            reason: reason.to_string(),
            recoverable,
        });
    }

    /// Reports the tunnel as torn down by someone other than the daemon.
    pub fn tear_down_externally(&self, handle: TunnelHandle) {
        self.lock().active.remove(&handle);
        let _ = self.events.send(TunnelEvent::TornDown { handle });
    }

    pub fn establish_count(&self) -> usize {
        self.lock().establish_calls.len()
    }

    pub fn teardown_count(&self) -> usize {
        self.lock().teardown_calls.len()
    }

    /// Relay configs seen by establish, oldest first.
    pub fn establish_calls(&self) -> Vec<RelayConfig> {
        self.lock().establish_calls.clone()
    }

    pub fn active_tunnels(&self) -> Vec<TunnelHandle> {
        let mut active: Vec<_> = self.lock().active.iter().copied().collect();
        active.sort_by_key(|handle| handle.0);
        active
    }

    async fn wait_for_gate(&self) {
        let mut rx = self.gate.subscribe();
        loop {
            let open = *rx.borrow_and_update();
            if open || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl TunnelCapability for InMemoryTunnel {
    async fn establish(&self, config: &RelayConfig) -> Result<TunnelHandle, TunnelError> {
        self.lock().establish_calls.push(config.clone());
        self.wait_for_gate().await;
        let scripted = self.lock().scripted.pop_front();
        scripted.unwrap_or(Ok(()))?;
        let handle = TunnelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.lock().active.insert(handle);
        debug!(%handle, relay = %config.relay, "in-memory tunnel up");
        Ok(handle)
    }

    async fn teardown(&self, handle: TunnelHandle) -> Result<(), TunnelError> {
        let mut state = self.lock();
        state.teardown_calls.push(handle);
        state.active.remove(&handle);
        debug!(%handle, "in-memory tunnel down");
        Ok(())
    }
}
