//! Domain types shared across the engine.

pub mod bar;
pub mod period;
pub mod signal;

pub use bar::Bar;
pub use period::{DateWindow, Interval, Period};
pub use signal::SignalType;
