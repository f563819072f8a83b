//! Pre-prepare handling: the entry step of a consensus round.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::interfaces::{ConsensusEngine, ProposalVerifyError, VerifierSet};
use crate::types::{Address, Block};

use super::messages::{ConsensusMessage, MessageCode, Preprepare, Subject, View};
use super::round::{RoundInfo, RoundState};
use super::{ConsensusError, ConsensusResult};

/// Event delivered to the serial consensus loop: fresh input from a peer or
/// a replayed message from the backlog.
#[derive(Clone, Debug)]
pub enum CoreEvent {
    Message {
        sender: Address,
        message: ConsensusMessage,
    },
    Backlog {
        sender: Address,
        message: ConsensusMessage,
    },
}

pub struct Core {
    address: Address,
    state: RoundState,
    current: RoundInfo,
    ver_set: VerifierSet,
    engine: Arc<dyn ConsensusEngine>,
    event_tx: UnboundedSender<CoreEvent>,
    outbound_tx: UnboundedSender<ConsensusMessage>,
    future_preprepare_timer: Option<JoinHandle<()>>,
    consensus_timestamp: Option<Instant>,
}

impl Core {
    pub fn new(
        address: Address,
        mut ver_set: VerifierSet,
        view: View,
        engine: Arc<dyn ConsensusEngine>,
        event_tx: UnboundedSender<CoreEvent>,
        outbound_tx: UnboundedSender<ConsensusMessage>,
    ) -> Self {
        let previous_proposer = engine.proposer(view.sequence.saturating_sub(1));
        ver_set.calc_proposer(&previous_proposer, view.round);
        Self {
            address,
            state: RoundState::AcceptRequest,
            current: RoundInfo::new(view),
            ver_set,
            engine,
            event_tx,
            outbound_tx,
            future_preprepare_timer: None,
            consensus_timestamp: None,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn current_view(&self) -> View {
        self.current.view()
    }

    pub fn lock_hash(&mut self, hash: String) {
        self.current.lock_hash(hash);
    }

    /// Instant the current preprepare was accepted at.
    pub fn consensus_timestamp(&self) -> Option<Instant> {
        self.consensus_timestamp
    }

    /// Serial event loop: messages, timer expirations, and backlog replays
    /// arrive as discrete events in order.
    pub async fn run(&mut self, mut events: UnboundedReceiver<CoreEvent>) {
        while let Some(event) = events.recv().await {
            let (sender, message) = match event {
                CoreEvent::Message { sender, message } => (sender, message),
                CoreEvent::Backlog { sender, message } => (sender, message),
            };
            match message.code {
                MessageCode::Preprepare => {
                    if let Err(err) = self.handle_preprepare(&message, &sender) {
                        match err {
                            ConsensusError::OldMessage | ConsensusError::FutureMessage => {
                                debug!(%err, "classified preprepare")
                            }
                            _ => warn!(%err, "preprepare rejected"),
                        }
                    }
                }
                other => debug!(?other, "message belongs to a later phase"),
            }
        }
    }

    /// Broadcasts a preprepare when this node is the proposer for the
    /// requested height.
    pub fn send_preprepare(&self, proposal: Block) {
        if self.current.sequence() == proposal.header.height && self.is_proposer() {
            let preprepare = Preprepare {
                view: self.current.view(),
                proposal,
            };
            match ConsensusMessage::preprepare(&preprepare) {
                Ok(message) => {
                    info!(
                        sequence = preprepare.view.sequence,
                        round = preprepare.view.round,
                        "broadcasting preprepare"
                    );
                    self.broadcast(message);
                }
                Err(err) => warn!(%err, "failed to encode preprepare"),
            }
        }
    }

    pub fn handle_preprepare(
        &mut self,
        message: &ConsensusMessage,
        sender: &str,
    ) -> ConsensusResult<()> {
        let preprepare = message.decode_preprepare()?;

        if let Err(err) = self.check_message(preprepare.view) {
            if err == ConsensusError::OldMessage {
                // if the sender proposed that older round and we already hold
                // the block, answer with a late commit instead of dropping it
                let mut ver_set = self.engine.parent_verifiers(&preprepare.proposal);
                let previous_height = preprepare.proposal.header.height.saturating_sub(1);
                let previous_proposer = self.engine.proposer(previous_height);
                ver_set.calc_proposer(&previous_proposer, preprepare.view.round);
                if ver_set.is_proposer(sender)
                    && self.engine.has_proposal(&preprepare.proposal.hash)
                {
                    self.send_old_commit(preprepare.view, preprepare.proposal.hash.clone());
                    return Ok(());
                }
            }
            return Err(err);
        }

        if !self.ver_set.is_proposer(sender) {
            warn!(sender = %sender, "ignoring preprepare that is not from the proposer");
            return Err(ConsensusError::NotProposer);
        }

        if let Err(err) = self.engine.verify(&preprepare.proposal) {
            return match err {
                ProposalVerifyError::CreateTimeInFuture { wait } => {
                    self.stop_future_preprepare_timer();
                    let event_tx = self.event_tx.clone();
                    let sender = sender.to_string();
                    let message = message.clone();
                    self.future_preprepare_timer = Some(tokio::spawn(async move {
                        sleep(wait).await;
                        let _ = event_tx.send(CoreEvent::Backlog { sender, message });
                    }));
                    Err(ConsensusError::BlockCreateTimeInFuture(wait))
                }
                ProposalVerifyError::Invalid(reason) => {
                    warn!(reason = %reason, "proposal failed verification");
                    self.send_next_round_change();
                    Err(ConsensusError::VerifyProposal(reason))
                }
            };
        }

        if self.state == RoundState::AcceptRequest {
            if self.current.is_hash_locked() {
                if Some(&preprepare.proposal.hash) == self.current.locked_hash() {
                    self.accept_preprepare(preprepare);
                    self.set_state(RoundState::Prepared);
                    self.send_commit();
                } else {
                    self.send_next_round_change();
                }
            } else {
                self.accept_preprepare(preprepare);
                self.set_state(RoundState::Preprepared);
                self.send_prepare();
            }
        }

        Ok(())
    }

    /// Classifies a message view against the monotonic current view.
    fn check_message(&self, view: View) -> ConsensusResult<()> {
        let current = self.current.view();
        if view == current {
            Ok(())
        } else if view < current {
            Err(ConsensusError::OldMessage)
        } else {
            Err(ConsensusError::FutureMessage)
        }
    }

    fn accept_preprepare(&mut self, preprepare: Preprepare) {
        self.consensus_timestamp = Some(Instant::now());
        self.current.set_preprepare(preprepare);
    }

    fn set_state(&mut self, next: RoundState) {
        if self.state.can_advance_to(next) {
            self.state = next;
        }
    }

    /// Moves this sequence to `round`, cancelling round-scoped timers.
    pub fn start_new_round(&mut self, round: u64) {
        self.stop_future_preprepare_timer();
        let view = View {
            sequence: self.current.sequence(),
            round,
        };
        self.current.start_new_round(view);
        self.state = RoundState::AcceptRequest;
        let previous_proposer = self.engine.proposer(view.sequence.saturating_sub(1));
        self.ver_set.calc_proposer(&previous_proposer, round);
    }

    fn stop_future_preprepare_timer(&mut self) {
        if let Some(timer) = self.future_preprepare_timer.take() {
            timer.abort();
        }
    }

    fn is_proposer(&self) -> bool {
        self.ver_set.is_proposer(&self.address)
    }

    fn send_prepare(&self) {
        if let Some(preprepare) = self.current.preprepare() {
            let subject = Subject {
                view: self.current.view(),
                digest: preprepare.proposal.hash.clone(),
            };
            self.broadcast(ConsensusMessage::subject(MessageCode::Prepare, &subject));
        }
    }

    fn send_commit(&self) {
        if let Some(preprepare) = self.current.preprepare() {
            let subject = Subject {
                view: self.current.view(),
                digest: preprepare.proposal.hash.clone(),
            };
            self.broadcast(ConsensusMessage::subject(MessageCode::Commit, &subject));
        }
    }

    /// Commit answering a stale preprepare whose block we already hold.
    fn send_old_commit(&self, view: View, digest: String) {
        self.broadcast(ConsensusMessage::subject(
            MessageCode::Commit,
            &Subject { view, digest },
        ));
    }

    fn send_next_round_change(&self) {
        let subject = Subject {
            view: View {
                sequence: self.current.sequence(),
                round: self.current.round() + 1,
            },
            digest: String::new(),
        };
        self.broadcast(ConsensusMessage::subject(MessageCode::RoundChange, &subject));
    }

    fn broadcast(&self, message: ConsensusMessage) {
        if self.outbound_tx.send(message).is_err() {
            warn!("outbound consensus channel closed");
        }
    }
}
