mod connection;
mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use repositories::{CodePolicy, CommitOutcome, FetchOutcome, ProxyTally, ResendOutcome};
