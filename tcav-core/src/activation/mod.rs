//! Activation sets and the collaborator contracts that produce them.
//!
//! The classifier is opaque: everything the pipeline knows about it comes
//! through [`ActivationProvider`], and everything it knows about datasets
//! comes through [`ExampleSource`].

pub mod repository;
pub mod table;

pub use repository::ActivationRepository;
pub use table::{ActivationTable, TableExample};

use crate::error::{Result, TcavError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Ordered activation vectors for one (layer, example group) pair.
///
/// Every vector has the same dimensionality; this is checked on construction
/// and on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct ActivationSet {
    vectors: Vec<Vec<f64>>,
    dim: usize,
}

impl ActivationSet {
    pub fn new(vectors: Vec<Vec<f64>>) -> Result<Self> {
        let dim = vectors.first().map_or(0, Vec::len);
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(TcavError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }
        Ok(Self { vectors, dim })
    }

    pub fn empty() -> Self {
        Self {
            vectors: Vec::new(),
            dim: 0,
        }
    }

    /// Feature count per vector (0 for an empty set).
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f64]> {
        self.vectors.iter().map(Vec::as_slice)
    }

    pub fn vectors(&self) -> &[Vec<f64>] {
        &self.vectors
    }

    pub fn into_vectors(self) -> Vec<Vec<f64>> {
        self.vectors
    }
}

impl TryFrom<Vec<Vec<f64>>> for ActivationSet {
    type Error = TcavError;

    fn try_from(vectors: Vec<Vec<f64>>) -> Result<Self> {
        Self::new(vectors)
    }
}

impl From<ActivationSet> for Vec<Vec<f64>> {
    fn from(set: ActivationSet) -> Self {
        set.vectors
    }
}

/// Identifier of an independently sampled random baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BaselineId(pub usize);

impl BaselineId {
    /// Example-group name of this baseline, e.g. `random500_3`.
    pub fn group_name(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.0)
    }
}

impl fmt::Display for BaselineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named group of examples whose activations are fetched together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExampleGroup {
    Concept(String),
    /// Random baseline, carried by its resolved group name.
    Random(String),
    Target(String),
}

impl ExampleGroup {
    pub fn name(&self) -> &str {
        match self {
            Self::Concept(name) | Self::Random(name) | Self::Target(name) => name,
        }
    }
}

impl fmt::Display for ExampleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concept(name) => write!(f, "concept '{name}'"),
            Self::Random(name) => write!(f, "random baseline '{name}'"),
            Self::Target(name) => write!(f, "target class '{name}'"),
        }
    }
}

/// Access to the trained classifier's internals.
///
/// Implementations wrapping a non-thread-safe inference session must
/// serialize calls themselves before being used with the parallel runner.
pub trait ActivationProvider {
    type Input;

    /// Activations of `layer` for each input, in input order.
    ///
    /// Fails with [`TcavError::UnknownLayer`] for an invalid extraction point
    /// and [`TcavError::ModelUnavailable`] when the model is not ready.
    fn activations(&self, inputs: &[Self::Input], layer: &str) -> Result<ActivationSet>;

    /// Class label to probability. Used for diagnostics only.
    fn predict(&self, input: &Self::Input) -> Result<BTreeMap<String, f64>>;
}

/// Lists the raw inputs belonging to concepts, baselines and target classes.
pub trait ExampleSource {
    type Input;

    fn concept_examples(&self, concept: &str) -> Result<Vec<Self::Input>>;

    fn random_examples(&self, baseline: &str) -> Result<Vec<Self::Input>>;

    fn target_examples(&self, target: &str) -> Result<Vec<Self::Input>>;

    fn examples(&self, group: &ExampleGroup) -> Result<Vec<Self::Input>> {
        match group {
            ExampleGroup::Concept(name) => self.concept_examples(name),
            ExampleGroup::Random(name) => self.random_examples(name),
            ExampleGroup::Target(name) => self.target_examples(name),
        }
    }
}

impl<T: ActivationProvider + ?Sized> ActivationProvider for &T {
    type Input = T::Input;

    fn activations(&self, inputs: &[Self::Input], layer: &str) -> Result<ActivationSet> {
        (**self).activations(inputs, layer)
    }

    fn predict(&self, input: &Self::Input) -> Result<BTreeMap<String, f64>> {
        (**self).predict(input)
    }
}

impl<T: ActivationProvider + ?Sized> ActivationProvider for Arc<T> {
    type Input = T::Input;

    fn activations(&self, inputs: &[Self::Input], layer: &str) -> Result<ActivationSet> {
        (**self).activations(inputs, layer)
    }

    fn predict(&self, input: &Self::Input) -> Result<BTreeMap<String, f64>> {
        (**self).predict(input)
    }
}

impl<T: ExampleSource + ?Sized> ExampleSource for &T {
    type Input = T::Input;

    fn concept_examples(&self, concept: &str) -> Result<Vec<Self::Input>> {
        (**self).concept_examples(concept)
    }

    fn random_examples(&self, baseline: &str) -> Result<Vec<Self::Input>> {
        (**self).random_examples(baseline)
    }

    fn target_examples(&self, target: &str) -> Result<Vec<Self::Input>> {
        (**self).target_examples(target)
    }
}

impl<T: ExampleSource + ?Sized> ExampleSource for Arc<T> {
    type Input = T::Input;

    fn concept_examples(&self, concept: &str) -> Result<Vec<Self::Input>> {
        (**self).concept_examples(concept)
    }

    fn random_examples(&self, baseline: &str) -> Result<Vec<Self::Input>> {
        (**self).random_examples(baseline)
    }

    fn target_examples(&self, target: &str) -> Result<Vec<Self::Input>> {
        (**self).target_examples(target)
    }
}
