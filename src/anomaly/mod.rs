pub mod config;
pub mod tracker;

pub use config::AnomalyConfig;
pub use tracker::{Attempt, AnomalyTracker};
