//! HTLC-level failure messages sent upstream, one per failed part.
//!
//! A state machine retains the failure it chose so that repeated
//! snapshots re-issue byte-identical errors; [`FailureMessage::encode`]
//! is therefore deterministic.

use serde::{Deserialize, Serialize};

const PERM: u16 = 0x4000;
const NODE: u16 = 0x2000;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMessage {
    /// The catch-all rejection which leaks nothing about why.
    IncorrectOrUnknownPaymentDetails { amount_msat: u64, height: u32 },
    TemporaryNodeFailure,
    TrampolineFeeInsufficient,
    TrampolineExpiryTooSoon,
    /// The multipart set did not complete in time.
    PaymentTimeout,
}

impl FailureMessage {
    pub fn code(&self) -> u16 {
        match self {
            Self::IncorrectOrUnknownPaymentDetails { .. } => PERM | 15,
            Self::TemporaryNodeFailure => NODE | 2,
            Self::TrampolineFeeInsufficient => NODE | 51,
            Self::TrampolineExpiryTooSoon => NODE | 52,
            Self::PaymentTimeout => 23,
        }
    }

    /// The failure's stable wire form: big-endian code plus payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.code().to_be_bytes().to_vec();
        if let Self::IncorrectOrUnknownPaymentDetails {
            amount_msat,
            height,
        } = self
        {
            out.extend_from_slice(&amount_msat.to_be_bytes());
            out.extend_from_slice(&height.to_be_bytes());
        }
        out
    }
}
