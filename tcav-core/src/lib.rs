//! # tcav-core: Testing with Concept Activation Vectors
//!
//! Quantifies how much a human-meaningful concept ("striped") influences a
//! classifier's predictions for a target class ("zebra"):
//!
//! 1. **Activations**: example groups are run through an opaque model at
//!    named layers ([`ActivationProvider`], [`ExampleSource`]).
//! 2. **CAVs**: a linear classifier separates concept activations from a
//!    random baseline; its weight vector is the concept direction.
//! 3. **Scores**: the share of target activations pointing along that
//!    direction.
//! 4. **Significance**: scores over independent random baselines are
//!    tested against random-vs-random scores.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

// Pipeline
pub mod activation;
pub mod analysis;
pub mod cav;
pub mod scorer;
pub mod significance;

// Re-exports
pub use activation::{
    ActivationProvider, ActivationRepository, ActivationSet, ActivationTable, BaselineId,
    ExampleGroup, ExampleSource,
};
pub use analysis::{AnalysisReport, TcavAnalysis, TcavResult};
pub use cav::{
    Cav, CavKey, CavPersistence, CavStore, CavTrainer, JsonCavPersistence, MemoryCavPersistence,
    TrainerConfig,
};
pub use config::{TcavConfig, load_config};
pub use error::{Result, TcavError};
pub use scorer::{SensitivityFrame, TcavScore, TcavScorer};
pub use significance::{SignificanceAggregator, SignificanceResult, SignificanceTest, WelchTTest};
