use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Connected, not yet serving; only auth messages may be written.
    Preparing = 0,
    Ok = 1,
    ActiveClosing = 2,
    ActiveClosed = 3,
    PassiveClosing = 4,
    PassiveClosed = 5,
    Redialing = 6,
    RedialFailed = 7,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Preparing,
            1 => SessionState::Ok,
            2 => SessionState::ActiveClosing,
            3 => SessionState::ActiveClosed,
            4 => SessionState::PassiveClosing,
            5 => SessionState::PassiveClosed,
            6 => SessionState::Redialing,
            _ => SessionState::RedialFailed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Preparing => "PREPARING",
            SessionState::Ok => "OK",
            SessionState::ActiveClosing => "ACTIVE_CLOSING",
            SessionState::ActiveClosed => "ACTIVE_CLOSED",
            SessionState::PassiveClosing => "PASSIVE_CLOSING",
            SessionState::PassiveClosed => "PASSIVE_CLOSED",
            SessionState::Redialing => "REDIALING",
            SessionState::RedialFailed => "REDIAL_FAILED",
        }
    }

    /// The read loop keeps going in these states.
    pub fn is_reading(&self) -> bool {
        matches!(self, SessionState::Ok | SessionState::ActiveClosing)
    }

    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Preparing, Ok)
                | (Preparing, ActiveClosing)
                | (Ok, ActiveClosing)
                | (ActiveClosing, ActiveClosed)
                | (Ok, PassiveClosing)
                | (PassiveClosing, PassiveClosed)
                | (PassiveClosing, Redialing)
                | (PassiveClosed, Redialing)
                | (Redialing, Ok)
                | (Redialing, RedialFailed)
                | (RedialFailed, PassiveClosed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free holder that only performs legal transitions.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `from -> to` if the current state is `from` and the pair is legal.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `to` from whichever of `from` is current. Returns the state left.
    pub(crate) fn transition_any(
        &self,
        from: &[SessionState],
        to: SessionState,
    ) -> Option<SessionState> {
        from.iter()
            .copied()
            .find(|&f| self.transition(f, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 8] = [
        Preparing,
        Ok,
        ActiveClosing,
        ActiveClosed,
        PassiveClosing,
        PassiveClosed,
        Redialing,
        RedialFailed,
    ];

    #[test]
    fn test_legal_pairs_count() {
        let legal = ALL
            .iter()
            .flat_map(|f| ALL.iter().map(move |t| (*f, *t)))
            .filter(|(f, t)| f.can_transition_to(*t))
            .count();
        assert_eq!(legal, 11);
        assert!(!ActiveClosed.can_transition_to(Ok));
        assert!(!Ok.can_transition_to(Redialing));
    }

    #[test]
    fn test_cas_rejects_stale_and_illegal() {
        let s = AtomicState::new(Preparing);
        assert!(!s.transition(Ok, ActiveClosing));
        assert!(!s.transition(Preparing, PassiveClosing));
        assert!(s.transition(Preparing, Ok));
        assert_eq!(s.transition_any(&[Preparing, Ok], ActiveClosing), Some(Ok));
        assert_eq!(s.transition_any(&[Preparing, Ok], ActiveClosing), None);
        assert_eq!(s.load(), ActiveClosing);
    }

    #[test]
    fn test_redial_cycle() {
        let s = AtomicState::new(Ok);
        assert!(s.transition(Ok, PassiveClosing));
        assert!(s.transition(PassiveClosing, Redialing));
        assert!(s.transition(Redialing, RedialFailed));
        assert!(s.transition(RedialFailed, PassiveClosed));
        assert!(s.transition(PassiveClosed, Redialing));
        assert!(s.transition(Redialing, Ok));
        assert!(s.load().is_reading());
    }
}
