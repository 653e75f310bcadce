use std::fmt;

use parking_lot::Mutex;

use crate::error::{PipelineError, Result};

// ── Role ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

// ── Control State Machine ─────────────────────────────────────────────────────

/// Master: Idle → Listening → BarrierWait → LayerSync → BlockSync → Ready → Closing → Closed
/// Worker: Idle → Connecting → Registered → BarrierWait → LayerSync → BlockSync → Ready → Disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    /// Master accepting registrations.
    Listening,
    /// Worker dialing the master.
    Connecting,
    /// Worker accepted by the master.
    Registered,
    BarrierWait,
    LayerSync,
    BlockSync,
    /// Negotiation complete; heartbeats only.
    Ready,
    Closing,
    Closed,
    Disconnected,
}

impl ControlState {
    fn is_negotiating(self) -> bool {
        matches!(self, Self::BarrierWait | Self::LayerSync | Self::BlockSync | Self::Ready)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Disconnected)
    }

    /// Whether `role` may move from `self` to `to`.
    pub fn can_transition(self, role: Role, to: ControlState) -> bool {
        use ControlState::*;
        if self.is_terminal() {
            return false;
        }
        match (role, self, to) {
            (_, _, Closing | Closed | Disconnected) => true,
            (Role::Master, Idle, Listening) => true,
            (Role::Worker, Idle, Connecting) => true,
            (Role::Worker, Connecting, Registered) => true,
            (Role::Master, Listening, t) | (Role::Worker, Registered, t) => t.is_negotiating(),
            (_, from, t) => from.is_negotiating() && t.is_negotiating(),
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle         => write!(f, "Idle"),
            Self::Listening    => write!(f, "Listening"),
            Self::Connecting   => write!(f, "Connecting"),
            Self::Registered   => write!(f, "Registered"),
            Self::BarrierWait  => write!(f, "BarrierWait"),
            Self::LayerSync    => write!(f, "LayerSync"),
            Self::BlockSync    => write!(f, "BlockSync"),
            Self::Ready        => write!(f, "Ready"),
            Self::Closing      => write!(f, "Closing"),
            Self::Closed       => write!(f, "Closed"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Current control state plus the role whose transition table applies.
#[derive(Debug)]
pub struct StateMachine {
    role: Role,
    state: Mutex<ControlState>,
}

impl StateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: Mutex::new(ControlState::Idle),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current(&self) -> ControlState {
        *self.state.lock()
    }

    pub fn transition(&self, to: ControlState) -> Result<()> {
        let mut state = self.state.lock();
        // Negotiation steps may repeat; a failed dial may be retried.
        if *state == to && (to.is_negotiating() || to == ControlState::Connecting) {
            return Ok(());
        }
        if !state.can_transition(self.role, to) {
            return Err(PipelineError::InvalidTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        *state = to;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_happy_path() {
        let sm = StateMachine::new(Role::Master);
        for s in [
            ControlState::Listening,
            ControlState::BarrierWait,
            ControlState::LayerSync,
            ControlState::BarrierWait,
            ControlState::BlockSync,
            ControlState::Ready,
            ControlState::Closing,
            ControlState::Closed,
        ] {
            sm.transition(s).unwrap();
        }
        assert_eq!(sm.current(), ControlState::Closed);
    }

    #[test]
    fn worker_happy_path() {
        let sm = StateMachine::new(Role::Worker);
        for s in [
            ControlState::Connecting,
            ControlState::Registered,
            ControlState::BarrierWait,
            ControlState::LayerSync,
            ControlState::BlockSync,
            ControlState::Ready,
            ControlState::Disconnected,
        ] {
            sm.transition(s).unwrap();
        }
    }

    #[test]
    fn invalid_transition_rejects() {
        let master = StateMachine::new(Role::Master);
        // Cannot negotiate before listening
        assert!(master.transition(ControlState::BarrierWait).is_err());
        // Workers never listen
        let worker = StateMachine::new(Role::Worker);
        assert!(worker.transition(ControlState::Listening).is_err());
        worker.transition(ControlState::Connecting).unwrap();
        assert!(worker.transition(ControlState::LayerSync).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let sm = StateMachine::new(Role::Worker);
        sm.transition(ControlState::Disconnected).unwrap();
        assert!(sm.transition(ControlState::Connecting).is_err());
    }
}
