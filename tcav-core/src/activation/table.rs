//! Precomputed activations served as a model.
//!
//! Layout on disk:
//!
//! ```text
//! <dir>/<layer>/<group>.json        JSON array of activation vectors
//! <dir>/predictions/<group>.json    optional, JSON array of {label: probability}
//! ```
//!
//! Groups are concept names, random baselines (`random500_0`, ...) and target
//! classes. Layer directory names are used verbatim as layer names.

use super::{ActivationProvider, ActivationSet, ExampleSource};
use crate::error::{Result, TcavError};
use crate::persistence::{list_json_files, load_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const PREDICTIONS_DIR: &str = "predictions";

/// One row of a group in an [`ActivationTable`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableExample {
    pub group: String,
    pub index: usize,
}

/// In-memory activations keyed by layer and example group.
#[derive(Debug, Clone, Default)]
pub struct ActivationTable {
    layers: BTreeMap<String, BTreeMap<String, ActivationSet>>,
    predictions: BTreeMap<String, Vec<BTreeMap<String, f64>>>,
}

impl ActivationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every layer directory and the optional predictions directory under `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(TcavError::not_found(format!(
                "activation directory {}",
                dir.display()
            )));
        }

        let mut table = Self::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        entries.sort();

        for layer_dir in entries {
            let Some(name) = layer_dir.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            for file in list_json_files(&layer_dir)? {
                let Some(group) = file.file_stem().map(|s| s.to_string_lossy().into_owned())
                else {
                    continue;
                };
                if name == PREDICTIONS_DIR {
                    if let Some(preds) = load_json(&file)? {
                        table.insert_predictions(&group, preds);
                    }
                } else if let Some(set) = load_json::<ActivationSet>(&file)? {
                    table.insert(&name, &group, set)?;
                }
            }
        }

        tracing::info!(
            dir = %dir.display(),
            layers = table.layers.len(),
            "Loaded activation table"
        );
        Ok(table)
    }

    /// Add a group's activations at `layer`.
    ///
    /// All groups of one layer must share a dimensionality.
    pub fn insert(&mut self, layer: &str, group: &str, set: ActivationSet) -> Result<()> {
        let groups = self.layers.entry(layer.to_string()).or_default();
        if let Some(existing) = groups.values().find(|s| !s.is_empty()) {
            if !set.is_empty() && set.dim() != existing.dim() {
                return Err(TcavError::DimensionMismatch {
                    expected: existing.dim(),
                    actual: set.dim(),
                });
            }
        }
        groups.insert(group.to_string(), set);
        Ok(())
    }

    pub fn insert_predictions(&mut self, group: &str, predictions: Vec<BTreeMap<String, f64>>) {
        self.predictions.insert(group.to_string(), predictions);
    }

    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    /// Every group name present at any layer.
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = self
            .layers
            .values()
            .flat_map(|g| g.keys().map(String::as_str))
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    fn group_examples(&self, group: &str) -> Result<Vec<TableExample>> {
        let count = self
            .layers
            .values()
            .filter_map(|groups| groups.get(group))
            .map(ActivationSet::len)
            .max()
            .ok_or_else(|| TcavError::not_found(format!("example group '{group}'")))?;
        Ok((0..count)
            .map(|index| TableExample {
                group: group.to_string(),
                index,
            })
            .collect())
    }
}

impl ExampleSource for ActivationTable {
    type Input = TableExample;

    fn concept_examples(&self, concept: &str) -> Result<Vec<TableExample>> {
        self.group_examples(concept)
    }

    fn random_examples(&self, baseline: &str) -> Result<Vec<TableExample>> {
        self.group_examples(baseline)
    }

    fn target_examples(&self, target: &str) -> Result<Vec<TableExample>> {
        self.group_examples(target)
    }
}

impl ActivationProvider for ActivationTable {
    type Input = TableExample;

    fn activations(&self, inputs: &[TableExample], layer: &str) -> Result<ActivationSet> {
        if self.layers.is_empty() {
            return Err(TcavError::model_unavailable("activation table is empty"));
        }
        let groups = self
            .layers
            .get(layer)
            .ok_or_else(|| TcavError::unknown_layer(layer))?;

        let mut vectors = Vec::with_capacity(inputs.len());
        for input in inputs {
            let set = groups.get(&input.group).ok_or_else(|| {
                TcavError::not_found(format!("group '{}' at layer '{layer}'", input.group))
            })?;
            let vector = set.vectors().get(input.index).ok_or_else(|| {
                TcavError::invalid_input(format!(
                    "example {} out of range for group '{}' ({} rows)",
                    input.index,
                    input.group,
                    set.len()
                ))
            })?;
            vectors.push(vector.clone());
        }
        ActivationSet::new(vectors)
    }

    fn predict(&self, input: &TableExample) -> Result<BTreeMap<String, f64>> {
        self.predictions
            .get(&input.group)
            .and_then(|rows| rows.get(input.index))
            .cloned()
            .ok_or_else(|| {
                TcavError::model_unavailable(format!(
                    "no prediction recorded for {}[{}]",
                    input.group, input.index
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn set(rows: &[[f64; 2]]) -> ActivationSet {
        ActivationSet::new(rows.iter().map(|r| r.to_vec()).collect()).unwrap()
    }

    #[test]
    fn test_insert_rejects_mixed_dimensions() {
        let mut table = ActivationTable::new();
        table.insert("mixed4c", "striped", set(&[[1.0, 2.0]])).unwrap();
        let wider = ActivationSet::new(vec![vec![1.0, 2.0, 3.0]]).unwrap();
        assert!(table.insert("mixed4c", "dotted", wider).is_err());
    }

    #[test]
    fn test_examples_and_activations() {
        let mut table = ActivationTable::new();
        table
            .insert("mixed4c", "striped", set(&[[1.0, 2.0], [3.0, 4.0]]))
            .unwrap();

        let examples = table.concept_examples("striped").unwrap();
        assert_eq!(examples.len(), 2);

        let acts = table.activations(&examples[1..], "mixed4c").unwrap();
        assert_eq!(acts.vectors(), &[vec![3.0, 4.0]]);
    }

    #[test]
    fn test_unknown_layer_and_group() {
        let mut table = ActivationTable::new();
        table.insert("mixed4c", "striped", set(&[[1.0, 2.0]])).unwrap();
        let examples = table.concept_examples("striped").unwrap();

        assert!(matches!(
            table.activations(&examples, "mixed5b"),
            Err(TcavError::UnknownLayer(_))
        ));
        assert!(matches!(
            table.concept_examples("furry"),
            Err(TcavError::NotFound(_))
        ));
    }

    #[test]
    fn test_empty_table_is_unavailable() {
        let table = ActivationTable::new();
        assert!(matches!(
            table.activations(&[], "mixed4c"),
            Err(TcavError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_from_dir_layout() {
        let dir = TempDir::new().unwrap();
        let layer = dir.path().join("mixed4c");
        std::fs::create_dir_all(&layer).unwrap();
        std::fs::write(layer.join("striped.json"), "[[1.0, 0.0], [0.5, 0.5]]").unwrap();
        std::fs::write(layer.join("random500_0.json"), "[[0.0, 1.0]]").unwrap();
        let preds = dir.path().join("predictions");
        std::fs::create_dir_all(&preds).unwrap();
        std::fs::write(preds.join("zebra.json"), r#"[{"zebra": 0.9, "horse": 0.1}]"#).unwrap();

        let table = ActivationTable::from_dir(dir.path()).unwrap();
        assert_eq!(table.layers().collect::<Vec<_>>(), vec!["mixed4c"]);
        assert_eq!(table.groups(), vec!["random500_0", "striped"]);

        let example = TableExample {
            group: "zebra".into(),
            index: 0,
        };
        assert_eq!(table.predict(&example).unwrap()["zebra"], 0.9);
    }

    #[test]
    fn test_from_dir_missing() {
        let err = ActivationTable::from_dir(Path::new("/nonexistent/activations")).unwrap_err();
        assert!(matches!(err, TcavError::NotFound(_)));
    }
}
