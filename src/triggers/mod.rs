/// Periodic error threshold evaluation
pub mod threshold_monitor;

pub use threshold_monitor::{count_errors, exceeds, ThresholdMonitor, ThresholdReport};
