//! Strategy contract: a pure function from a bar window to a signal.

use crate::domain::{Bar, SignalType};

/// A trading strategy evaluated against one provider's dataset.
///
/// Implementations must be pure: the same bars always give the same signal.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Signal for the most recent bar of `bars` (ascending by date).
    fn evaluate(&self, bars: &[Bar]) -> SignalType;

    /// Bars needed before the strategy can say anything but hold.
    fn min_bars(&self) -> usize {
        1
    }
}
