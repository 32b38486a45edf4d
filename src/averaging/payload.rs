use serde::{Deserialize, Serialize};

use crate::transport::PeerId;

/// What the local process brings to a round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundPayload {
    /// Mean gradient over every sample accumulated for the round.
    pub gradient: Vec<f32>,
    /// The current parameters, only present on state averaging epochs.
    pub parameters: Option<Vec<f32>>,
    pub samples: u64,
}

/// A single peer's versioned contribution to the round of `epoch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub peer: PeerId,
    pub run_id: String,
    pub epoch: u64,
    pub samples: u64,
    pub gradient: Vec<f32>,
    pub parameters: Option<Vec<f32>>,
}

impl Contribution {
    /// Stamps a local payload with the identity and epoch of the round it belongs to.
    pub fn from_payload(peer: PeerId, run_id: impl Into<String>, epoch: u64, payload: RoundPayload) -> Self {
        let RoundPayload {
            gradient,
            parameters,
            samples,
        } = payload;

        Self {
            peer,
            run_id: run_id.into(),
            epoch,
            samples,
            gradient,
            parameters,
        }
    }
}
