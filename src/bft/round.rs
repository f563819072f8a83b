use super::messages::{Preprepare, View};

/// Phase of the current round. A handler only advances out of the state its
/// phase owns; a preprepare is never re-accepted once the round has moved on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundState {
    AcceptRequest,
    Preprepared,
    Prepared,
    Committed,
}

impl RoundState {
    /// Legal forward transitions of the three-phase protocol.
    pub fn can_advance_to(self, next: RoundState) -> bool {
        matches!(
            (self, next),
            (RoundState::AcceptRequest, RoundState::Preprepared)
                | (RoundState::AcceptRequest, RoundState::Prepared)
                | (RoundState::Preprepared, RoundState::Prepared)
                | (RoundState::Prepared, RoundState::Committed)
        )
    }
}

/// Bookkeeping for the round the node is currently in.
#[derive(Clone, Debug)]
pub struct RoundInfo {
    view: View,
    preprepare: Option<Preprepare>,
    locked_hash: Option<String>,
}

impl RoundInfo {
    pub fn new(view: View) -> Self {
        Self {
            view,
            preprepare: None,
            locked_hash: None,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn sequence(&self) -> u64 {
        self.view.sequence
    }

    pub fn round(&self) -> u64 {
        self.view.round
    }

    pub fn set_preprepare(&mut self, preprepare: Preprepare) {
        self.preprepare = Some(preprepare);
    }

    pub fn preprepare(&self) -> Option<&Preprepare> {
        self.preprepare.as_ref()
    }

    /// Locks the round onto a proposal hash; divergent proposals are refused
    /// until the lock clears with a round change.
    pub fn lock_hash(&mut self, hash: String) {
        self.locked_hash = Some(hash);
    }

    pub fn unlock_hash(&mut self) {
        self.locked_hash = None;
    }

    pub fn is_hash_locked(&self) -> bool {
        self.locked_hash.is_some()
    }

    pub fn locked_hash(&self) -> Option<&String> {
        self.locked_hash.as_ref()
    }

    /// Moves to `view`, dropping the preprepare slot. The hash lock survives
    /// round changes within the same sequence.
    pub fn start_new_round(&mut self, view: View) {
        if view.sequence != self.view.sequence {
            self.locked_hash = None;
        }
        self.view = view;
        self.preprepare = None;
    }
}
