/// Polling follower for a single file
pub mod follower;

/// Registry and lifecycle of the followers
pub mod tail_supervisor;

pub use follower::{FollowOutcome, Follower};
pub use tail_supervisor::TailSupervisor;
