//! TCAV analysis over every (layer, concept) pair.
//!
//! Layers form the outer loop and concepts the inner one, so results come
//! back in the same order for identical inputs. The first error aborts the
//! run; re-running with a narrower concept or layer set picks trained CAVs
//! back up from the store.

use crate::activation::{
    ActivationProvider, ActivationRepository, ActivationSet, BaselineId, ExampleGroup,
    ExampleSource,
};
use crate::cav::{Cav, CavKey, CavPersistence, CavStore, CavTrainer};
use crate::config::TcavConfig;
use crate::error::{Result, TcavError};
use crate::scorer::{TcavScore, TcavScorer};
use crate::significance::{SignificanceAggregator, SignificanceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Score of one concept at one layer against the primary baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcavResult {
    pub layer: String,
    pub concept: String,
    pub score: f64,
    pub baseline: String,
    pub cav_accuracy: f64,
}

/// Everything a run produced, as written by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub run_id: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub results: Vec<TcavResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub significance: Vec<SignificanceResult>,
}

impl AnalysisReport {
    pub fn new(target: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            created_at: Utc::now(),
            results: Vec::new(),
            significance: Vec::new(),
        }
    }
}

pub struct TcavAnalysis<S, P, C> {
    repository: ActivationRepository<S, P>,
    store: CavStore<C>,
    trainer: CavTrainer,
    scorer: TcavScorer,
    aggregator: SignificanceAggregator,
    alphas: Vec<f64>,
    num_random_exp: usize,
    random_prefix: String,
}

impl<S, P, C> TcavAnalysis<S, P, C>
where
    S: ExampleSource,
    P: ActivationProvider<Input = S::Input>,
    C: CavPersistence,
{
    /// Analysis with default trainer, scorer and significance settings.
    pub fn new(repository: ActivationRepository<S, P>, store: CavStore<C>) -> Self {
        let experiment = crate::config::ExperimentConfig::default();
        Self {
            repository,
            store,
            trainer: CavTrainer::default(),
            scorer: TcavScorer::default(),
            aggregator: SignificanceAggregator::default(),
            alphas: experiment.alphas,
            num_random_exp: experiment.num_random_exp,
            random_prefix: experiment.random_prefix,
        }
    }

    pub fn from_config(
        config: &TcavConfig,
        repository: ActivationRepository<S, P>,
        store: CavStore<C>,
    ) -> Self {
        Self::new(repository, store)
            .with_trainer(CavTrainer::new(config.training.clone()))
            .with_scorer(TcavScorer::new(config.scoring.frame))
            .with_aggregator(SignificanceAggregator::new(config.significance.level))
            .with_alphas(config.experiment.alphas.clone())
            .with_num_random_exp(config.experiment.num_random_exp)
            .with_random_prefix(&config.experiment.random_prefix)
    }

    pub fn with_trainer(mut self, trainer: CavTrainer) -> Self {
        self.trainer = trainer;
        self
    }

    pub fn with_scorer(mut self, scorer: TcavScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_aggregator(mut self, aggregator: SignificanceAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_alphas(mut self, alphas: Vec<f64>) -> Self {
        self.alphas = alphas;
        self
    }

    pub fn with_num_random_exp(mut self, num_random_exp: usize) -> Self {
        self.num_random_exp = num_random_exp;
        self
    }

    pub fn with_random_prefix(mut self, prefix: &str) -> Self {
        self.random_prefix = prefix.to_string();
        self
    }

    pub fn store(&self) -> &CavStore<C> {
        &self.store
    }

    pub fn repository(&self) -> &ActivationRepository<S, P> {
        &self.repository
    }

    fn baseline(&self, id: BaselineId) -> String {
        id.group_name(&self.random_prefix)
    }

    /// TCAV score of every concept at every layer, against baseline 0.
    pub fn run(
        &self,
        target: &str,
        concepts: &[String],
        layers: &[String],
    ) -> Result<Vec<TcavResult>> {
        let mut results = Vec::with_capacity(layers.len() * concepts.len());
        for layer in layers {
            tracing::info!(layer = %layer, target_class = target, "Processing layer");
            let targets = self.target_activations(target, layer)?;
            for concept in concepts {
                results.push(self.score_concept(&targets, concept, layer)?);
            }
        }
        Ok(results)
    }

    /// Per-baseline scores for every pair, tested against random-vs-random
    /// scores at the same layer.
    pub fn run_with_significance(
        &self,
        target: &str,
        concepts: &[String],
        layers: &[String],
    ) -> Result<Vec<SignificanceResult>> {
        if self.num_random_exp == 0 {
            return Err(TcavError::invalid_input("num_random_exp must be at least 1"));
        }

        let mut results = Vec::with_capacity(layers.len() * concepts.len());
        for layer in layers {
            tracing::info!(
                layer = %layer,
                target_class = target,
                experiments = self.num_random_exp,
                "Processing layer with random experiments"
            );
            let targets = self.target_activations(target, layer)?;
            let null = self.null_scores(&targets, layer)?;

            for concept in concepts {
                let positive = ExampleGroup::Concept(concept.clone());
                let scores = (0..self.num_random_exp)
                    .map(|i| {
                        let cav = self.cav_for(&positive, layer, &self.baseline(BaselineId(i)))?;
                        self.scorer.score(&targets, &cav)
                    })
                    .collect::<Result<Vec<_>>>()?;

                let summary = self
                    .aggregator
                    .aggregate(concept, layer, scores, self.num_random_exp)?;
                results.push(self.aggregator.compare_to_null(summary, &null));
            }
        }
        Ok(results)
    }

    /// Share of target examples whose top-1 prediction is the target class.
    pub fn target_prediction_rate(&self, target: &str) -> Result<f64> {
        let predictions = self
            .repository
            .predictions(&ExampleGroup::Target(target.to_string()))?;
        if predictions.is_empty() {
            tracing::warn!(target_class = target, "No target examples to check predictions for");
            return Ok(0.0);
        }
        let hits = predictions
            .iter()
            .filter(|probs| {
                probs
                    .iter()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .is_some_and(|(label, _)| label == target)
            })
            .count();
        Ok(hits as f64 / predictions.len() as f64)
    }

    /// Score one pair from scratch, fetching target activations itself.
    pub fn evaluate_pair(&self, target: &str, concept: &str, layer: &str) -> Result<TcavResult> {
        let targets = self.target_activations(target, layer)?;
        self.score_concept(&targets, concept, layer)
    }

    fn target_activations(&self, target: &str, layer: &str) -> Result<ActivationSet> {
        self.repository
            .fetch(&ExampleGroup::Target(target.to_string()), layer)
    }

    fn score_concept(
        &self,
        targets: &ActivationSet,
        concept: &str,
        layer: &str,
    ) -> Result<TcavResult> {
        let baseline = self.baseline(BaselineId(0));
        let cav = self.cav_for(&ExampleGroup::Concept(concept.to_string()), layer, &baseline)?;
        let score = self.scorer.score(targets, &cav)?;
        Ok(TcavResult {
            layer: layer.to_string(),
            concept: concept.to_string(),
            score: score.score,
            baseline,
            cav_accuracy: cav.accuracy,
        })
    }

    /// Random baseline `i` scored as if it were a concept, trained against
    /// baseline `i + 1` (wrapping). Needs at least two baselines.
    fn null_scores(&self, targets: &ActivationSet, layer: &str) -> Result<Vec<TcavScore>> {
        let n = self.num_random_exp;
        if n < 2 {
            return Ok(Vec::new());
        }
        (0..n)
            .map(|i| {
                let positive = ExampleGroup::Random(self.baseline(BaselineId(i)));
                let negative = self.baseline(BaselineId((i + 1) % n));
                let cav = self.cav_for(&positive, layer, &negative)?;
                self.scorer.score(targets, &cav)
            })
            .collect()
    }

    fn cav_for(&self, positive: &ExampleGroup, layer: &str, baseline: &str) -> Result<Cav> {
        let key = CavKey::new(positive.name(), layer, baseline);
        self.store.get_or_train(&key, || {
            tracing::info!(key = %key, "Training CAV");
            let concept = self.repository.fetch(positive, layer)?;
            let random = self
                .repository
                .fetch(&ExampleGroup::Random(baseline.to_string()), layer)?;
            self.trainer.train(key.clone(), &concept, &random, &self.alphas)
        })
    }
}

impl<S, P, C> TcavAnalysis<S, P, C>
where
    S: ExampleSource + Send + Sync + 'static,
    P: ActivationProvider<Input = S::Input> + Send + Sync + 'static,
    C: CavPersistence + Send + Sync + 'static,
{
    /// Same results and order as [`run`](Self::run), with up to `workers`
    /// pairs evaluated at once on the blocking pool.
    pub async fn run_parallel(
        self: Arc<Self>,
        target: &str,
        concepts: &[String],
        layers: &[String],
        workers: usize,
    ) -> Result<Vec<TcavResult>> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();

        let pairs = layers
            .iter()
            .flat_map(|layer| concepts.iter().map(move |concept| (layer, concept)));
        let mut total = 0;
        for (index, (layer, concept)) in pairs.enumerate() {
            total += 1;
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let (target, concept, layer) = (target.to_string(), concept.clone(), layer.clone());
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| TcavError::Task(e.to_string()))?;
                let result = tokio::task::spawn_blocking(move || {
                    this.evaluate_pair(&target, &concept, &layer)
                })
                .await
                .map_err(|e| TcavError::Task(e.to_string()))??;
                Ok::<_, TcavError>((index, result))
            });
        }

        let mut slots: Vec<Option<TcavResult>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| TcavError::Task(e.to_string())).and_then(|r| r);
            match outcome {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => {
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TcavError::Task("a parallel task finished without a result".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationTable;
    use crate::cav::MemoryCavPersistence;
    use pretty_assertions::assert_eq;

    fn rows(center: f64, n: usize, spread: f64) -> ActivationSet {
        ActivationSet::new(
            (0..n)
                .map(|i| {
                    let wiggle = spread * ((i as f64 * 1.7).sin());
                    vec![center + wiggle, center - wiggle, center + 0.5 * wiggle]
                })
                .collect(),
        )
        .unwrap()
    }

    fn table(layers: &[&str]) -> ActivationTable {
        let mut table = ActivationTable::new();
        for layer in layers {
            table.insert(layer, "striped", rows(1.0, 8, 0.1)).unwrap();
            table.insert(layer, "dotted", rows(-1.0, 8, 0.1)).unwrap();
            table.insert(layer, "random500_0", rows(0.0, 8, 0.1)).unwrap();
            table.insert(layer, "random500_1", rows(0.05, 8, 0.1)).unwrap();
            table.insert(layer, "zebra", rows(1.0, 6, 0.05)).unwrap();
        }
        table
    }

    fn analysis(
        table: ActivationTable,
    ) -> TcavAnalysis<Arc<ActivationTable>, Arc<ActivationTable>, MemoryCavPersistence> {
        let shared = Arc::new(table);
        let repository = ActivationRepository::new(Arc::clone(&shared), shared);
        TcavAnalysis::new(repository, CavStore::new(MemoryCavPersistence::new()))
            .with_num_random_exp(2)
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_run_orders_layers_then_concepts() {
        let analysis = analysis(table(&["L1", "L2"]));
        let results = analysis
            .run("zebra", &names(&["striped", "dotted"]), &names(&["L1", "L2"]))
            .unwrap();

        let order: Vec<(&str, &str)> = results
            .iter()
            .map(|r| (r.layer.as_str(), r.concept.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("L1", "striped"),
                ("L1", "dotted"),
                ("L2", "striped"),
                ("L2", "dotted"),
            ]
        );
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
        assert_eq!(results[0].score, 1.0);
        assert_eq!(results[1].score, 0.0);
    }

    #[test]
    fn test_rerun_uses_cached_cavs() {
        let analysis = analysis(table(&["L1"]));
        let concepts = names(&["striped"]);
        let layers = names(&["L1"]);

        let first = analysis.run("zebra", &concepts, &layers).unwrap();
        let second = analysis.run("zebra", &concepts, &layers).unwrap();
        assert_eq!(first, second);
        assert_eq!(analysis.store().misses(), 1);
        assert_eq!(analysis.store().hits(), 1);
    }

    #[test]
    fn test_unknown_layer_aborts_run() {
        let analysis = analysis(table(&["L1"]));
        let err = analysis
            .run("zebra", &names(&["striped"]), &names(&["L1", "L9"]))
            .unwrap_err();
        assert!(matches!(err, TcavError::UnknownLayer(ref l) if l == "L9"));
    }

    #[test]
    fn test_missing_concept_aborts_run() {
        let analysis = analysis(table(&["L1"]));
        let err = analysis
            .run("zebra", &names(&["furry"]), &names(&["L1"]))
            .unwrap_err();
        assert!(matches!(err, TcavError::NotFound(_)));
    }

    #[test]
    fn test_significance_uses_distinct_baselines() {
        let analysis = analysis(table(&["L1"]));
        let results = analysis
            .run_with_significance("zebra", &names(&["striped"]), &names(&["L1"]))
            .unwrap();

        assert_eq!(results.len(), 1);
        let result = &results[0];
        let baselines: Vec<_> = result
            .scores
            .iter()
            .map(|s| s.baseline.clone().unwrap())
            .collect();
        assert_eq!(baselines, vec!["random500_0", "random500_1"]);
        assert_eq!(result.null_scores.len(), 2);
        assert_eq!(result.mean, 1.0);

        // Two concept CAVs plus two random-vs-random CAVs.
        assert_eq!(analysis.store().persistence().list().unwrap().len(), 4);
    }

    #[test]
    fn test_single_random_experiment_has_no_null() {
        let analysis = analysis(table(&["L1"])).with_num_random_exp(1);
        let results = analysis
            .run_with_significance("zebra", &names(&["striped"]), &names(&["L1"]))
            .unwrap();
        assert!(results[0].null_scores.is_empty());
        assert_eq!(results[0].p_value, None);
        assert_eq!(results[0].significant, None);
    }

    #[test]
    fn test_target_prediction_rate() {
        let mut table = table(&["L1"]);
        table.insert_predictions(
            "zebra",
            vec![
                [("zebra".to_string(), 0.9), ("horse".to_string(), 0.1)].into(),
                [("zebra".to_string(), 0.2), ("horse".to_string(), 0.8)].into(),
            ],
        );
        let rate = analysis(table).target_prediction_rate("zebra").unwrap();
        assert_eq!(rate, 0.5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_matches_sequential() {
        let concepts = names(&["striped", "dotted"]);
        let layers = names(&["L1", "L2", "L3"]);

        let sequential = analysis(table(&["L1", "L2", "L3"]))
            .run("zebra", &concepts, &layers)
            .unwrap();
        let parallel = Arc::new(analysis(table(&["L1", "L2", "L3"])))
            .run_parallel("zebra", &concepts, &layers, 3)
            .await
            .unwrap();

        let strip = |rs: &[TcavResult]| -> Vec<(String, String, f64)> {
            rs.iter()
                .map(|r| (r.layer.clone(), r.concept.clone(), r.score))
                .collect()
        };
        assert_eq!(strip(&sequential), strip(&parallel));
    }

    #[tokio::test]
    async fn test_parallel_propagates_errors() {
        let err = Arc::new(analysis(table(&["L1"])))
            .run_parallel("zebra", &names(&["striped"]), &names(&["L1", "nope"]), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, TcavError::UnknownLayer(_)));
    }
}
