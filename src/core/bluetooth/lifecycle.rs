//! Connection lifecycle state machine.
//!
//! `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`.
//! Every `begin_connect` opens a new generation. Whoever ends a generation
//! (the caller, the peer, or a failed connect) must first win
//! `claim_teardown`; the claim can be won once per generation.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{BleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// State plus the generation it belongs to, as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub generation: u64,
    pub state: ConnectionState,
}

/// Proof of having won the teardown of one generation.
#[derive(Debug)]
#[must_use = "a claimed teardown must be finished"]
pub struct TeardownClaim {
    generation: u64,
}

impl TeardownClaim {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    generation: u64,
    teardown_claimed: AtomicBool,
    tx: watch::Sender<LinkState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LinkState {
            generation: 0,
            state: ConnectionState::Disconnected,
        });
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            teardown_claimed: AtomicBool::new(false),
            tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn link_state(&self) -> LinkState {
        LinkState {
            generation: self.generation,
            state: self.state,
        }
    }

    /// True when `generation` is current and connected.
    pub fn is_connected(&self, generation: u64) -> bool {
        self.generation == generation && self.state == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.tx.subscribe()
    }

    fn set(&mut self, state: ConnectionState) {
        debug!("Connection #{}: {:?} -> {:?}", self.generation, self.state, state);
        self.state = state;
        self.tx.send_replace(self.link_state());
    }

    /// Opens a new logical connection. Only valid from `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<u64> {
        match self.state {
            ConnectionState::Disconnected => {
                self.generation += 1;
                self.teardown_claimed.store(false, Ordering::Release);
                self.set(ConnectionState::Connecting);
                Ok(self.generation)
            }
            ConnectionState::Connected => Err(BleError::Connection("already connected".to_string())),
            ConnectionState::Connecting | ConnectionState::Disconnecting => Err(BleError::Connection(
                format!("connection is busy ({:?})", self.state),
            )),
        }
    }

    /// `Connecting -> Connected`. False when the generation was torn down meanwhile.
    pub fn connect_succeeded(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.set(ConnectionState::Connected);
        true
    }

    /// Claims the single teardown of `generation` and moves to `Disconnecting`.
    /// Returns `None` when the generation is stale, never got going, or
    /// someone else already claimed it.
    pub fn claim_teardown(&mut self, generation: u64) -> Option<TeardownClaim> {
        if self.generation != generation {
            return None;
        }
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return None;
        }
        if self
            .teardown_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.set(ConnectionState::Disconnecting);
        Some(TeardownClaim { generation })
    }

    /// `Disconnecting -> Disconnected` once cleanup has run.
    pub fn finish_teardown(&mut self, claim: TeardownClaim) {
        if claim.generation == self.generation && self.state == ConnectionState::Disconnecting {
            self.set(ConnectionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut lifecycle = Lifecycle::new();
        let generation = lifecycle.begin_connect().unwrap();
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert!(lifecycle.connect_succeeded(generation));
        assert!(lifecycle.is_connected(generation));

        let claim = lifecycle.claim_teardown(generation).unwrap();
        assert_eq!(lifecycle.state(), ConnectionState::Disconnecting);
        lifecycle.finish_teardown(claim);
        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_teardown_claimed_once_per_generation() {
        let mut lifecycle = Lifecycle::new();
        let generation = lifecycle.begin_connect().unwrap();
        lifecycle.connect_succeeded(generation);

        let claim = lifecycle.claim_teardown(generation);
        assert!(claim.is_some());
        assert!(lifecycle.claim_teardown(generation).is_none());
        lifecycle.finish_teardown(claim.unwrap());
        assert!(lifecycle.claim_teardown(generation).is_none());
    }

    #[test]
    fn test_new_generation_resets_claim() {
        let mut lifecycle = Lifecycle::new();
        let first = lifecycle.begin_connect().unwrap();
        lifecycle.connect_succeeded(first);
        let claim = lifecycle.claim_teardown(first).unwrap();
        lifecycle.finish_teardown(claim);

        let second = lifecycle.begin_connect().unwrap();
        assert_ne!(first, second);
        assert!(lifecycle.claim_teardown(first).is_none());
        assert!(lifecycle.claim_teardown(second).is_some());
    }

    #[test]
    fn test_connect_rejected_while_busy() {
        let mut lifecycle = Lifecycle::new();
        let generation = lifecycle.begin_connect().unwrap();
        assert!(matches!(lifecycle.begin_connect(), Err(BleError::Connection(_))));
        lifecycle.connect_succeeded(generation);
        assert!(matches!(lifecycle.begin_connect(), Err(BleError::Connection(_))));
    }

    #[test]
    fn test_late_success_after_teardown_is_ignored() {
        let mut lifecycle = Lifecycle::new();
        let generation = lifecycle.begin_connect().unwrap();
        let claim = lifecycle.claim_teardown(generation).unwrap();
        lifecycle.finish_teardown(claim);
        assert!(!lifecycle.connect_succeeded(generation));
        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_observers_see_transitions() {
        let mut lifecycle = Lifecycle::new();
        let rx = lifecycle.subscribe();
        let generation = lifecycle.begin_connect().unwrap();
        lifecycle.connect_succeeded(generation);
        assert_eq!(
            *rx.borrow(),
            LinkState {
                generation,
                state: ConnectionState::Connected
            }
        );
    }
}
