mod anomalies;
mod attendance;
mod codes;
mod enrollments;
mod lockouts;
mod presence;
mod sessions;

pub use anomalies::ProxyTally;
pub use attendance::CommitOutcome;
pub use codes::{CodePolicy, FetchOutcome, ResendOutcome};
