//! The fixed custody sequence and the per-phase outcome vocabulary.
//!
//! Phases are totally ordered: `Collection < Testing < Processing <
//! Manufacturing`. A batch only ever moves to [`Phase::next`]; the
//! derived `Ord` is what the state machine uses to assert that
//! `current_phase` never regresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One stage of custody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Collection,
    Testing,
    Processing,
    Manufacturing,
}

impl Phase {
    /// All phases in custody order.
    pub const ALL: [Phase; 4] = [
        Phase::Collection,
        Phase::Testing,
        Phase::Processing,
        Phase::Manufacturing,
    ];

    /// Zero-based position in the custody sequence. Also the phase index
    /// used when mirroring decisions to the ledger.
    pub fn index(self) -> u8 {
        match self {
            Phase::Collection => 0,
            Phase::Testing => 1,
            Phase::Processing => 2,
            Phase::Manufacturing => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Phase> {
        Phase::ALL.get(index as usize).copied()
    }

    /// The phase that follows this one, or `None` at the terminal phase.
    pub fn next(self) -> Option<Phase> {
        Phase::from_index(self.index() + 1)
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Collection => "collection",
            Phase::Testing => "testing",
            Phase::Processing => "processing",
            Phase::Manufacturing => "manufacturing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown phase, status, or decision name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseVocabularyError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Phase {
    type Err = ParseVocabularyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseVocabularyError {
                kind: "phase",
                value: s.to_string(),
            })
    }
}

/// Sub-status of a batch at its current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Approved,
    Rejected,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Approved => "approved",
            Status::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseVocabularyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "approved" => Ok(Status::Approved),
            "rejected" => Ok(Status::Rejected),
            _ => Err(ParseVocabularyError {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// An actor's decision on a phase. A pending placeholder is a record
/// whose decision is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    /// Code written to the ledger. `0` is the chain's implicit pending state.
    pub fn ledger_code(self) -> u8 {
        match self {
            Decision::Approved => 1,
            Decision::Rejected => 2,
        }
    }

    pub fn from_ledger_code(code: u8) -> Option<Decision> {
        match code {
            1 => Some(Decision::Approved),
            2 => Some(Decision::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = ParseVocabularyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approved" => Ok(Decision::Approved),
            "rejected" => Ok(Decision::Rejected),
            _ => Err(ParseVocabularyError {
                kind: "decision",
                value: s.to_string(),
            }),
        }
    }
}

/// The `(phase, status)` a batch lands in after `decision` is applied at
/// `phase`. Approval of a non-terminal phase advances and resets to
/// pending in the same step, so `Approved` is only ever settled at the
/// terminal phase.
pub fn transition(phase: Phase, decision: Decision) -> (Phase, Status) {
    match (decision, phase.next()) {
        (Decision::Rejected, _) => (phase, Status::Rejected),
        (Decision::Approved, Some(next)) => (next, Status::Pending),
        (Decision::Approved, None) => (phase, Status::Approved),
    }
}

/// Whether a batch in this state can accept no further decisions.
pub fn is_terminal_state(phase: Phase, status: Status) -> bool {
    match status {
        Status::Pending => false,
        Status::Rejected => true,
        Status::Approved => phase.is_terminal(),
    }
}
