pub mod engine;
pub mod policy;

pub use engine::{decide, FactorOutcome, VerificationResult};
pub use policy::{FactorRequirement, FusionDefaults, FusionPolicy};
