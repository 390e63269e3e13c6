//! Connection state and the edges allowed between states.

/// Lifecycle state of the single managed peripheral connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Scanning for peripherals.
    Scanning,
    /// Waiting for the transport to report the connect outcome.
    Connecting,
    /// Connected, enumerating services and characteristics.
    Discovering,
    /// Services known, primary characteristic subscribed.
    Ready,
    /// The link is gone; settles into Idle or ReconnectPending.
    Disconnected,
    /// A reconnect attempt is scheduled.
    ReconnectPending,
}

impl ConnectionState {
    /// All states, in lifecycle order.
    pub const ALL: [ConnectionState; 7] = [
        Self::Idle,
        Self::Scanning,
        Self::Connecting,
        Self::Discovering,
        Self::Ready,
        Self::Disconnected,
        Self::ReconnectPending,
    ];

    /// Check if the connection is usable for reads and writes.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if a connect attempt is underway or a link is established.
    pub fn is_connecting_or_connected(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Discovering | Self::Disconnected | Self::ReconnectPending
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle edge.
    ///
    /// Any state may fall back to Idle (explicit disconnect, scan failure,
    /// or a disconnect that is not eligible for reconnection).
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Idle {
            return *self != Idle;
        }

        matches!(
            (*self, next),
            (Idle, Scanning)
                | (Scanning, Connecting)
                | (Connecting, Discovering)
                | (Connecting, Disconnected)
                | (Discovering, Ready)
                | (Discovering, Disconnected)
                | (Ready, Disconnected)
                | (Disconnected, ReconnectPending)
                | (ReconnectPending, Connecting)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::ReconnectPending => write!(f, "ReconnectPending"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::Discovering.is_ready());

        assert!(ConnectionState::Connecting.is_connecting_or_connected());
        assert!(ConnectionState::Ready.is_connecting_or_connected());
        assert!(!ConnectionState::ReconnectPending.is_connecting_or_connected());

        assert!(ConnectionState::ReconnectPending.is_transitioning());
        assert!(!ConnectionState::Idle.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(
            format!("{}", ConnectionState::ReconnectPending),
            "ReconnectPending"
        );
    }

    #[test]
    fn test_lifecycle_edges() {
        use ConnectionState::*;

        assert!(Idle.can_transition_to(Scanning));
        assert!(Scanning.can_transition_to(Connecting));
        assert!(Ready.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(ReconnectPending));
        assert!(ReconnectPending.can_transition_to(Connecting));

        assert!(!Idle.can_transition_to(Connecting));
        assert!(!Scanning.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(ReconnectPending));
        assert!(!Idle.can_transition_to(Idle));
    }

    fn any_state() -> impl Strategy<Value = ConnectionState> {
        proptest::sample::select(ConnectionState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_every_active_state_can_return_to_idle(state in any_state()) {
            prop_assert_eq!(
                state.can_transition_to(ConnectionState::Idle),
                state != ConnectionState::Idle
            );
        }

        #[test]
        fn prop_ready_is_only_entered_from_discovering(state in any_state()) {
            prop_assert_eq!(
                state.can_transition_to(ConnectionState::Ready),
                state == ConnectionState::Discovering
            );
        }

        #[test]
        fn prop_no_self_loops(state in any_state()) {
            prop_assert!(!state.can_transition_to(state));
        }
    }
}
