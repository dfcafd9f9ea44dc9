//! Shared helpers

pub mod throttle;
pub mod timer;

pub use throttle::LogThrottler;
pub use timer::CancellableTimer;
