use serde::{Deserialize, Serialize};

use crate::types::Block;

use super::{ConsensusError, ConsensusResult};

/// Position of a message in consensus time. Ordering is lexicographic on
/// `(sequence, round)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct View {
    pub sequence: u64,
    pub round: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageCode {
    Preprepare,
    Prepare,
    Commit,
    RoundChange,
}

/// Envelope exchanged between verifiers; `payload` is the bincode body for
/// `code`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub code: MessageCode,
    pub payload: Vec<u8>,
}

impl ConsensusMessage {
    pub fn preprepare(preprepare: &Preprepare) -> ConsensusResult<Self> {
        let payload = bincode::serialize(preprepare).map_err(|_| ConsensusError::DecodePreprepare)?;
        Ok(Self {
            code: MessageCode::Preprepare,
            payload,
        })
    }

    pub fn subject(code: MessageCode, subject: &Subject) -> Self {
        Self {
            code,
            payload: bincode::serialize(subject).unwrap_or_default(),
        }
    }

    pub fn decode_preprepare(&self) -> ConsensusResult<Preprepare> {
        if self.code != MessageCode::Preprepare {
            return Err(ConsensusError::DecodePreprepare);
        }
        bincode::deserialize(&self.payload).map_err(|_| ConsensusError::DecodePreprepare)
    }

    pub fn decode_subject(&self) -> Option<Subject> {
        bincode::deserialize(&self.payload).ok()
    }
}

/// First-phase message: the proposer's proposal bound to a view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Preprepare {
    pub view: View,
    pub proposal: Block,
}

/// Body of prepare, commit, and round-change messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub view: View,
    pub digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, ConsensusKind};

    #[test]
    fn views_order_by_sequence_then_round() {
        let base = View {
            sequence: 5,
            round: 2,
        };
        assert!(View {
            sequence: 4,
            round: 9
        } < base);
        assert!(View {
            sequence: 5,
            round: 1
        } < base);
        assert!(View {
            sequence: 5,
            round: 3
        } > base);
        assert!(View {
            sequence: 6,
            round: 0
        } > base);
    }

    #[test]
    fn preprepare_round_trips_through_the_envelope() {
        let header = BlockHeader::new(
            "00".repeat(32),
            "aa".repeat(20),
            3,
            "11".repeat(32),
            1_700_000_000,
            ConsensusKind::Bft,
        );
        let preprepare = Preprepare {
            view: View {
                sequence: 3,
                round: 0,
            },
            proposal: Block::new(header, Vec::new(), Vec::new(), Vec::new()),
        };
        let message = ConsensusMessage::preprepare(&preprepare).unwrap();
        let decoded = message.decode_preprepare().unwrap();
        assert_eq!(decoded.view, preprepare.view);
        assert_eq!(decoded.proposal.hash, preprepare.proposal.hash);
    }

    #[test]
    fn wrong_code_does_not_decode_as_preprepare() {
        let message = ConsensusMessage::subject(
            MessageCode::Commit,
            &Subject {
                view: View {
                    sequence: 1,
                    round: 0,
                },
                digest: "aa".into(),
            },
        );
        assert_eq!(
            message.decode_preprepare().unwrap_err(),
            ConsensusError::DecodePreprepare
        );
    }
}
