//! Per-leg state vocabulary
//!
//! Every session the bridge sees moves through
//! `InviteReceived -> {Provisional, EarlyMedia} -> Confirmed -> Terminated`.
//! `Failure` and `Canceled` end a leg from any live state, and
//! `ReInviteReceived` only happens on a confirmed leg.

use super::message::SipRequest;
use serde::Serialize;
use std::fmt;

/// Which side opened the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LegDirection {
    /// We received the INVITE
    Inbound,
    /// We sent the INVITE
    Outbound,
}

/// Leg state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LegState {
    InviteReceived,
    Provisional,
    EarlyMedia,
    Confirmed,
    ReInviteReceived,
    Failure,
    Canceled,
    Terminated,
}

impl LegState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LegState::Failure | LegState::Canceled | LegState::Terminated
        )
    }

    pub fn is_early(&self) -> bool {
        matches!(
            self,
            LegState::InviteReceived | LegState::Provisional | LegState::EarlyMedia
        )
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: LegState) -> bool {
        use LegState::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            InviteReceived => false,
            Provisional | EarlyMedia => self.is_early(),
            Confirmed => self.is_early() || *self == ReInviteReceived,
            ReInviteReceived => matches!(self, Confirmed | ReInviteReceived),
            Terminated => matches!(self, Confirmed | ReInviteReceived),
            Failure | Canceled => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LegState::InviteReceived => "InviteReceived",
            LegState::Provisional => "Provisional",
            LegState::EarlyMedia => "EarlyMedia",
            LegState::Confirmed => "Confirmed",
            LegState::ReInviteReceived => "ReInviteReceived",
            LegState::Failure => "Failure",
            LegState::Canceled => "Canceled",
            LegState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A state transition reported by the session layer for one leg
#[derive(Debug, Clone)]
pub enum LegEvent {
    /// A new inbound session; carries the initial INVITE
    InviteReceived(SipRequest),
    ReInviteReceived {
        direction: LegDirection,
    },
    Provisional {
        status_code: u16,
        reason: String,
    },
    /// Provisional response carrying a session description
    EarlyMedia {
        status_code: u16,
        reason: String,
    },
    Confirmed,
    Failure {
        status_code: u16,
        reason: String,
    },
    Canceled,
    Terminated,
}

impl LegEvent {
    pub fn state(&self) -> LegState {
        match self {
            LegEvent::InviteReceived(_) => LegState::InviteReceived,
            LegEvent::ReInviteReceived { .. } => LegState::ReInviteReceived,
            LegEvent::Provisional { .. } => LegState::Provisional,
            LegEvent::EarlyMedia { .. } => LegState::EarlyMedia,
            LegEvent::Confirmed => LegState::Confirmed,
            LegEvent::Failure { .. } => LegState::Failure,
            LegEvent::Canceled => LegState::Canceled,
            LegEvent::Terminated => LegState::Terminated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use LegState::*;

        assert!(InviteReceived.can_transition_to(Provisional));
        assert!(Provisional.can_transition_to(EarlyMedia));
        assert!(EarlyMedia.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(ReInviteReceived));
        assert!(ReInviteReceived.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Terminated));
    }

    #[test]
    fn test_invalid_transitions() {
        use LegState::*;

        assert!(!Terminated.can_transition_to(Confirmed));
        assert!(!Failure.can_transition_to(Canceled));
        assert!(!Confirmed.can_transition_to(Provisional));
        assert!(!Provisional.can_transition_to(ReInviteReceived));
        assert!(!InviteReceived.can_transition_to(Terminated));
    }

    #[test]
    fn test_failure_and_cancel_from_any_live_state() {
        use LegState::*;

        for state in [InviteReceived, Provisional, EarlyMedia, Confirmed, ReInviteReceived] {
            assert!(state.can_transition_to(Failure), "{}", state);
            assert!(state.can_transition_to(Canceled), "{}", state);
        }
    }

    #[test]
    fn test_event_state_mapping() {
        let event = LegEvent::Failure {
            status_code: 486,
            reason: "Busy Here".to_string(),
        };
        assert_eq!(event.state(), LegState::Failure);
        assert!(event.is_terminal());
        assert!(!LegEvent::Confirmed.is_terminal());
    }
}
