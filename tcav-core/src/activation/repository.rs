//! Example lookup plus optional on-disk caching of activation sets.

use super::{ActivationProvider, ActivationSet, ExampleGroup, ExampleSource};
use crate::error::{Result, TcavError};
use crate::persistence::{atomic_write_json, file_component, load_json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Cache location of one activation set: `<dir>/<layer>/<group>.json`, with
/// both names percent-encoded.
pub fn activation_cache_path(dir: &Path, group: &str, layer: &str) -> PathBuf {
    dir.join(file_component(layer))
        .join(format!("{}.json", file_component(group)))
}

/// Resolves example groups to activation sets.
///
/// Sets are only cached on disk; in memory they belong to the caller and are
/// dropped once consumed.
pub struct ActivationRepository<S, P> {
    source: S,
    provider: P,
    max_examples: Option<usize>,
    cache_dir: Option<PathBuf>,
}

impl<S, P> ActivationRepository<S, P> {
    pub fn new(source: S, provider: P) -> Self {
        Self {
            source,
            provider,
            max_examples: None,
            cache_dir: None,
        }
    }

    /// Cap the number of examples taken from each group.
    pub fn with_max_examples(mut self, max_examples: usize) -> Self {
        self.max_examples = Some(max_examples);
        self
    }

    /// Persist fetched activation sets under `dir` and reuse them later.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    fn cache_path(&self, group: &ExampleGroup, layer: &str) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| activation_cache_path(dir, group.name(), layer))
    }
}

impl<S, P> ActivationRepository<S, P>
where
    S: ExampleSource,
    P: ActivationProvider<Input = S::Input>,
{
    /// Inputs of `group`, truncated to the configured maximum.
    pub fn examples(&self, group: &ExampleGroup) -> Result<Vec<S::Input>> {
        let mut inputs = self.source.examples(group)?;
        if let Some(max) = self.max_examples {
            inputs.truncate(max);
        }
        Ok(inputs)
    }

    /// Activations of `group` at `layer`.
    pub fn fetch(&self, group: &ExampleGroup, layer: &str) -> Result<ActivationSet> {
        let cache_path = self.cache_path(group, layer);
        if let Some(path) = &cache_path {
            if let Some(set) = load_json::<ActivationSet>(path)? {
                tracing::debug!(%group, layer, path = %path.display(), "Loaded cached activations");
                return Ok(set);
            }
        }

        let inputs = self.examples(group)?;
        tracing::debug!(%group, layer, examples = inputs.len(), "Generating activations");
        let set = self.provider.activations(&inputs, layer)?;
        if set.len() != inputs.len() {
            return Err(TcavError::invalid_input(format!(
                "provider returned {} activations for {} inputs of {group}",
                set.len(),
                inputs.len()
            )));
        }

        if let Some(path) = &cache_path {
            atomic_write_json(path, &set)?;
            tracing::debug!(%group, layer, path = %path.display(), "Saved activations");
        }
        Ok(set)
    }

    /// Class probabilities for every example of `group`.
    pub fn predictions(&self, group: &ExampleGroup) -> Result<Vec<BTreeMap<String, f64>>> {
        self.examples(group)?
            .iter()
            .map(|input| self.provider.predict(input))
            .collect()
    }
}
