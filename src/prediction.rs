//! Input prediction strategies for the speculative client timeline.
//!
//! When a client advances its predictive state it has no real inputs for
//! remote peers; a [`PredictionStrategy`] fills the gap. The default,
//! [`RepeatLastKnown`], repeats each peer's most recent confirmed input -
//! players hold buttons far more often than they change them, so this is
//! right often enough that most frames never need a rollback.
//!
//! Predictions are purely local: a wrong guess costs one replay, nothing
//! more. Strategies still must not consult wall clocks, randomness or any
//! other state that differs between a first prediction and its replay, or the
//! replayed timeline will not be reproducible.

use crate::Frame;

/// Guesses a remote peer's input for a frame whose real input has not arrived.
///
/// # Example
///
/// ```
/// use bastion_netcode::{Frame, PredictionStrategy};
///
/// /// A strategy for games where "keep doing nothing" is safer than
/// /// repeating a possibly dangerous input.
/// struct HoldStill;
///
/// impl PredictionStrategy<u8> for HoldStill {
///     fn predict(&self, _frame: Frame, _last_known: Option<u8>) -> u8 {
///         0
///     }
/// }
/// ```
pub trait PredictionStrategy<I: Copy + Default>: Send + Sync {
    /// Predicts the input for `frame` given the peer's most recent known
    /// input, if any.
    fn predict(&self, frame: Frame, last_known: Option<I>) -> I;
}

/// The default strategy: repeat the peer's last known input, falling back to
/// the neutral default before anything is known.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepeatLastKnown;

impl<I: Copy + Default> PredictionStrategy<I> for RepeatLastKnown {
    fn predict(&self, _frame: Frame, last_known: Option<I>) -> I {
        last_known.unwrap_or_default()
    }
}

/// Always predicts the neutral default input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeutralPrediction;

impl<I: Copy + Default> PredictionStrategy<I> for NeutralPrediction {
    fn predict(&self, _frame: Frame, _last_known: Option<I>) -> I {
        I::default()
    }
}

// #########
// # TESTS #
// #########
