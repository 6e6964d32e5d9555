pub mod manager;
pub mod state;
pub mod sweeper;

pub use manager::{IssuedCode, ResentCode, SessionManager};
pub use state::ConsumeOutcome;
pub use sweeper::ArchiveSweeper;
