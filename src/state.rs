//! Agent lifecycle states and the observable state stream.

use tokio::sync::watch;

/// Lifecycle state of an [`crate::agent::Agent`].
///
/// Transitions are monotone: `Uninitialized -> Initializing -> Initialized`,
/// and from any of those three into `Disposing -> Disposed`. No transition
/// ever leaves `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Uninitialized,
    Initializing,
    Initialized,
    Disposing,
    Disposed,
}

impl AgentState {
    /// Whether `to` is a legal transition from `self` per the state graph in
    /// the permission matrix.
    pub fn can_transition_to(self, to: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, to),
            (Uninitialized, Initializing)
                | (Initializing, Initialized)
                | (Uninitialized, Disposing)
                | (Initializing, Disposing)
                | (Initialized, Disposing)
                | (Disposing, Disposed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Disposed)
    }
}

/// Single-writer, multi-reader broadcast of the agent's current lifecycle
/// state. A new subscriber immediately observes the current value, matching
/// a `tokio::sync::watch` channel's semantics.
pub(crate) struct StateCell {
    tx: watch::Sender<AgentState>,
}

impl StateCell {
    pub(crate) fn new(initial: AgentState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub(crate) fn get(&self) -> AgentState {
        *self.tx.borrow()
    }

    /// Publishes a new state. Callers are responsible for holding whatever
    /// lock guards the transition so that readers never observe a state
    /// change interleaved with a partial update.
    pub(crate) fn set(&self, state: AgentState) {
        // A send error means there are no receivers left; that is fine, the
        // value is still updated for future subscribers.
        let _ = self.tx.send(state);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_only() {
        assert!(AgentState::Uninitialized.can_transition_to(AgentState::Initializing));
        assert!(AgentState::Initializing.can_transition_to(AgentState::Initialized));
        assert!(AgentState::Initialized.can_transition_to(AgentState::Disposing));
        assert!(AgentState::Disposing.can_transition_to(AgentState::Disposed));
        assert!(!AgentState::Disposed.can_transition_to(AgentState::Initializing));
        assert!(!AgentState::Initialized.can_transition_to(AgentState::Uninitialized));
        assert!(!AgentState::Initializing.can_transition_to(AgentState::Uninitialized));
    }

    #[test]
    fn disposed_is_terminal() {
        assert!(AgentState::Disposed.is_terminal());
        assert!(!AgentState::Initialized.is_terminal());
    }

    #[tokio::test]
    async fn subscriber_sees_current_value_immediately() {
        let cell = StateCell::new(AgentState::Uninitialized);
        cell.set(AgentState::Initializing);
        let rx = cell.subscribe();
        assert_eq!(*rx.borrow(), AgentState::Initializing);
    }
}
