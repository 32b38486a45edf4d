mod averager;
mod merge;
mod payload;

pub use averager::{AveragingMode, PeerAverager, RoundHandle, RoundReport, RoundSummary};
pub use merge::{MergedRound, weighted_average};
pub use payload::{Contribution, RoundPayload};
