//! Shared generator state agreement between the two peers.
//!
//! Entering character select or a match arms a one-shot exchange for the new match
//! instance. The authority (host, or broadcaster for its spectators) reads its generator
//! state from the host simulation and sends it. The consumer (client, spectator) may not
//! simulate the armed instance until that state arrived and was written into its own host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};

/// Generator states retained for late spectators.
const MAX_HISTORY: usize = 16;

/// Opaque generator state for one match instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngState {
    /// Match instance the state belongs to.
    pub index: u32,
    /// Serialized generator state.
    pub blob: Vec<u8>,
}

impl RngState {
    /// Creates a generator state for `index`.
    #[must_use]
    pub fn new(index: u32, blob: Vec<u8>) -> Self {
        Self { index, blob }
    }
}

/// What a session does in the exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConsensusRole {
    /// Generates the state (host, broadcast).
    Authority,
    /// Waits for and applies the state (client, spectator).
    Consumer,
    /// Takes no part (offline, or role not known yet).
    Passive,
}

/// One-shot generator state exchange per armed match instance.
///
/// ```
/// use fortress_netplay::consensus::{ConsensusChannel, ConsensusRole, RngState};
///
/// let mut host = ConsensusChannel::new(ConsensusRole::Authority);
/// let mut client = ConsensusChannel::new(ConsensusRole::Consumer);
///
/// assert!(host.arm(3));
/// assert!(client.arm(3));
/// assert!(!client.is_ready(3));
///
/// let state = host.produce(3, vec![1, 2, 3]).unwrap();
/// client.receive(state);
/// assert!(client.is_ready(3));
/// assert_eq!(client.take_for_apply(3).unwrap().blob, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct ConsensusChannel {
    role: ConsensusRole,
    armed: Option<u32>,
    /// Last state produced by the authority.
    current: Option<RngState>,
    /// Produced or received states, newest last, for late spectators.
    history: BTreeMap<u32, RngState>,
    /// States received but not yet applied.
    received: BTreeMap<u32, RngState>,
}

impl ConsensusChannel {
    /// Creates a channel for `role`.
    #[must_use]
    pub fn new(role: ConsensusRole) -> Self {
        Self {
            role,
            armed: None,
            current: None,
            history: BTreeMap::new(),
            received: BTreeMap::new(),
        }
    }

    /// Role in the exchange.
    #[must_use]
    pub fn role(&self) -> ConsensusRole {
        self.role
    }

    /// Changes the role, dropping anything armed.
    pub fn set_role(&mut self, role: ConsensusRole) {
        self.role = role;
        self.armed = None;
    }

    /// Arms the exchange for match instance `index`. Passive channels never arm.
    pub fn arm(&mut self, index: u32) -> bool {
        if self.role == ConsensusRole::Passive {
            return false;
        }
        tracing::trace!(index, role = ?self.role, "consensus armed");
        self.armed = Some(index);
        true
    }

    /// Instance armed and not yet settled.
    #[must_use]
    pub fn armed(&self) -> Option<u32> {
        self.armed
    }

    /// `true` while the authority still owes the state for `index`.
    #[must_use]
    pub fn needs_produce(&self, index: u32) -> bool {
        self.role == ConsensusRole::Authority && self.armed == Some(index)
    }

    /// Authority: records `blob` as the state of `index` and disarms.
    ///
    /// Returns the state to send, or `None` if this channel may not produce.
    pub fn produce(&mut self, index: u32, blob: Vec<u8>) -> Option<RngState> {
        if self.role != ConsensusRole::Authority {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Consensus,
                "{:?} role tried to generate the shared state for index {}",
                self.role,
                index
            );
            return None;
        }
        if self.armed != Some(index) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Consensus,
                "state produced for index {} while armed for {:?}",
                index,
                self.armed
            );
        }
        self.armed = None;
        let state = RngState::new(index, blob);
        self.remember(state.clone());
        self.current = Some(state.clone());
        Some(state)
    }

    /// Consumer: stores a received state until its instance is simulated.
    pub fn receive(&mut self, state: RngState) {
        if self.role != ConsensusRole::Consumer {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Consensus,
                "{:?} role received a shared state for index {}",
                self.role,
                state.index
            );
            return;
        }
        tracing::trace!(index = state.index, "consensus state received");
        self.remember(state.clone());
        self.received.insert(state.index, state);
    }

    fn remember(&mut self, state: RngState) {
        self.history.insert(state.index, state);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_first();
        }
    }

    /// `false` only while armed for `index` and waiting for the state to arrive.
    #[must_use]
    pub fn is_ready(&self, index: u32) -> bool {
        match self.armed {
            Some(armed) if armed == index && self.role == ConsensusRole::Consumer => {
                self.received.contains_key(&index)
            },
            _ => true,
        }
    }

    /// Consumer: takes the state for `index` to write into the host, and disarms.
    pub fn take_for_apply(&mut self, index: u32) -> Option<RngState> {
        if self.role != ConsensusRole::Consumer || self.armed != Some(index) {
            return None;
        }
        let state = self.received.remove(&index)?;
        self.armed = None;
        Some(state)
    }

    /// Last state produced by the authority.
    #[must_use]
    pub fn current(&self) -> Option<&RngState> {
        self.current.as_ref()
    }

    /// Retained states for instances at or after `index`, oldest first.
    pub fn history_from(&self, index: u32) -> impl Iterator<Item = &RngState> {
        self.history.range(index..).map(|(_, state)| state)
    }

    /// Drops received and retained states of instances before `index`.
    pub fn prune_before(&mut self, index: u32) {
        self.received = self.received.split_off(&index);
        self.history = self.history.split_off(&index);
    }
}

impl InvariantChecker for ConsensusChannel {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.role == ConsensusRole::Passive && self.armed.is_some() {
            return Err(InvariantViolation::new(
                "ConsensusChannel",
                "passive channel is armed",
            ));
        }
        if self.role != ConsensusRole::Consumer && !self.received.is_empty() {
            return Err(InvariantViolation::new(
                "ConsensusChannel",
                "non-consumer holds received states",
            )
            .with_details(format!("received={}", self.received.len())));
        }
        if self.history.len() > MAX_HISTORY {
            return Err(InvariantViolation::new(
                "ConsensusChannel",
                "history exceeds bound",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn passive_never_arms() {
        let mut channel = ConsensusChannel::new(ConsensusRole::Passive);
        assert!(!channel.arm(1));
        assert!(channel.is_ready(1));
    }

    #[test]
    fn authority_is_never_blocked() {
        let mut channel = ConsensusChannel::new(ConsensusRole::Authority);
        channel.arm(4);
        assert!(channel.is_ready(4));
        assert!(channel.needs_produce(4));
        let state = channel.produce(4, vec![9]).unwrap();
        assert_eq!(state.index, 4);
        assert!(!channel.needs_produce(4));
        assert_eq!(channel.current(), Some(&state));
    }

    #[test]
    fn consumer_cannot_produce() {
        let mut channel = ConsensusChannel::new(ConsensusRole::Consumer);
        channel.arm(2);
        assert!(channel.produce(2, vec![1]).is_none());
        assert!(!channel.is_ready(2));
    }

    #[test]
    fn authority_ignores_received_state() {
        let mut channel = ConsensusChannel::new(ConsensusRole::Authority);
        channel.receive(RngState::new(1, vec![1]));
        assert!(channel.check_invariants().is_ok());
        assert_eq!(channel.history_from(0).count(), 0);
    }

    #[test]
    fn consumer_accepts_early_state() {
        let mut channel = ConsensusChannel::new(ConsensusRole::Consumer);
        channel.receive(RngState::new(5, vec![5]));
        assert!(channel.take_for_apply(5).is_none());
        channel.arm(5);
        assert!(channel.is_ready(5));
        assert_eq!(channel.take_for_apply(5).unwrap().blob, vec![5]);
        assert_eq!(channel.armed(), None);
    }

    #[test]
    fn epochs_are_one_shot() {
        let mut channel = ConsensusChannel::new(ConsensusRole::Consumer);
        channel.arm(2);
        channel.receive(RngState::new(2, vec![2]));
        assert!(channel.take_for_apply(2).is_some());
        assert!(channel.take_for_apply(2).is_none());
        channel.arm(3);
        assert!(!channel.is_ready(3));
    }

    #[test]
    fn history_is_bounded_and_prunable() {
        let mut channel = ConsensusChannel::new(ConsensusRole::Authority);
        for index in 0..(MAX_HISTORY as u32 + 4) {
            channel.arm(index);
            channel.produce(index, vec![index as u8]);
        }
        assert_eq!(channel.history_from(0).count(), MAX_HISTORY);
        assert_eq!(channel.history_from(18).count(), 2);
        channel.prune_before(19);
        assert_eq!(channel.history_from(0).count(), 1);
        assert!(channel.check_invariants().is_ok());
    }
}
