//! typed ceremony state machines
//!
//! each state is its own type and every transition consumes the previous
//! state, so a round-2 call cannot be written against a ceremony whose
//! round-1 commitments are not fixed yet. transitions are pure: the
//! coordinator does the i/o and feeds results in.
//!
//! signing: `Idle → SharesRetrieved → Round1Committed → Round2Signed → Aggregated → Wiped`
//!
//! keygen: `Idle → Committed → Dealt → Finalized`

pub mod keygen;
pub mod signing;

use serde::{Deserialize, Serialize};

use crate::Error;

pub use keygen::KeygenCeremony;
pub use signing::SigningCeremony;

opaque_id!(
    /// one run of a distributed protocol
    CeremonyId
);

opaque_id!(
    /// one logical signing key across all its shares
    KeyId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    Keygen,
    Import,
    Signing,
}

/// furthest point a ceremony reached, for audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyPhase {
    Idle,
    // signing
    SharesRetrieved,
    Round1Committed,
    Round2Signed,
    Aggregated,
    Wiped,
    // keygen / import
    Committed,
    Dealt,
    Finalized,
}

impl core::fmt::Display for CeremonyPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            CeremonyPhase::Idle => "idle",
            CeremonyPhase::SharesRetrieved => "shares_retrieved",
            CeremonyPhase::Round1Committed => "round1_committed",
            CeremonyPhase::Round2Signed => "round2_signed",
            CeremonyPhase::Aggregated => "aggregated",
            CeremonyPhase::Wiped => "wiped",
            CeremonyPhase::Committed => "committed",
            CeremonyPhase::Dealt => "dealt",
            CeremonyPhase::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

/// a ceremony state type and the phase it stands for
pub trait State {
    const PHASE: CeremonyPhase;
}

/// why a transition was refused, and by whose fault if known
#[derive(Debug)]
pub struct CeremonyFault {
    pub error: Error,
    pub culprits: Vec<u32>,
}

impl CeremonyFault {
    pub fn new(error: Error) -> Self {
        Self {
            error,
            culprits: Vec::new(),
        }
    }

    pub fn blame(error: Error, culprit: u32) -> Self {
        Self {
            error,
            culprits: vec![culprit],
        }
    }

    pub fn blame_all(error: Error, culprits: Vec<u32>) -> Self {
        Self { error, culprits }
    }
}

impl From<Error> for CeremonyFault {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

pub type Transition<T> = core::result::Result<T, CeremonyFault>;
