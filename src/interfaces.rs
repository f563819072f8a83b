//! Seams between the node core and its consensus collaborators.

use std::time::Duration;

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;
use crate::types::{Address, Block, Debt};

/// Outcome of engine-level proposal verification.
#[derive(Debug)]
pub enum ProposalVerifyError {
    /// The proposal's creation timestamp lies in the near future; retry
    /// after `wait`.
    CreateTimeInFuture { wait: Duration },
    Invalid(String),
}

/// Capabilities the BFT core and the assembly task consume from the engine.
pub trait ConsensusEngine: Send + Sync {
    fn private_key(&self) -> &Keypair;
    fn verify(&self, proposal: &Block) -> Result<(), ProposalVerifyError>;
    fn proposer(&self, height: u64) -> Address;
    fn parent_verifiers(&self, proposal: &Block) -> VerifierSet;
    fn has_proposal(&self, hash: &str) -> bool;
}

/// Cross-shard settlement check applied before a debt is packed on the
/// non-BFT path.
pub trait DebtVerifier: Send + Sync {
    fn validate(&self, debt: &Debt) -> ChainResult<()>;
}

/// Ordered verifier roster with the proposer computed for a given round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifierSet {
    verifiers: Vec<Address>,
    proposer: Option<Address>,
}

impl VerifierSet {
    pub fn new(verifiers: Vec<Address>) -> Self {
        Self {
            verifiers,
            proposer: None,
        }
    }

    pub fn len(&self) -> usize {
        self.verifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.verifiers.iter().any(|verifier| verifier == address)
    }

    pub fn verifiers(&self) -> &[Address] {
        &self.verifiers
    }

    /// Round-robin rotation seeded by the previous proposer's position.
    pub fn calc_proposer(&mut self, last_proposer: &str, round: u64) {
        if self.verifiers.is_empty() {
            self.proposer = None;
            return;
        }
        let seed = self
            .verifiers
            .iter()
            .position(|verifier| verifier == last_proposer)
            .map(|position| position as u64 + 1)
            .unwrap_or(0);
        let offset = ((seed + round) % self.verifiers.len() as u64) as usize;
        self.proposer = Some(self.verifiers[offset].clone());
    }

    pub fn proposer(&self) -> Option<&Address> {
        self.proposer.as_ref()
    }

    pub fn is_proposer(&self, address: &str) -> bool {
        self.proposer.as_deref() == Some(address)
    }
}
