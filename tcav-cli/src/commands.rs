//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, RunArgs};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tcav_core::config::WORKSPACE_CONFIG;
use tcav_core::persistence::atomic_write_json;
use tcav_core::{
    ActivationRepository, ActivationTable, AnalysisReport, CavStore, JsonCavPersistence,
    SignificanceResult, TcavAnalysis, TcavConfig, TcavError, TcavResult,
};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => handle_run(args, workspace, config_file).await,
        Commands::Cavs => handle_cavs(workspace, config_file),
        Commands::Config { action } => handle_config(action, workspace, config_file),
    }
}

fn load(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<TcavConfig> {
    tcav_core::load_config(Some(workspace), config_file).context("Configuration error")
}

/// Fold command-line overrides into the loaded configuration.
fn apply_overrides(config: &mut TcavConfig, args: &RunArgs) -> anyhow::Result<()> {
    if let Some(target) = &args.target {
        config.experiment.target = target.clone();
    }
    if !args.concepts.is_empty() {
        config.experiment.concepts = args.concepts.clone();
    }
    if !args.layers.is_empty() {
        config.experiment.layers = args.layers.clone();
    }
    if let Some(workers) = args.workers {
        config.runtime.workers = workers;
    }
    config.validate().context("Invalid run options")?;
    Ok(())
}

async fn handle_run(
    args: RunArgs,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let mut config = load(workspace, config_file)?;
    apply_overrides(&mut config, &args)?;
    let report = run_analysis(&config, &args, workspace).await?;

    print_results(&report.results);
    if !report.significance.is_empty() {
        print_significance(&report.significance, config.significance.level);
    }

    if let Some(output) = &args.output {
        atomic_write_json(output, &report)
            .with_context(|| format!("Failed to write report to {}", output.display()))?;
        println!("\nReport written to {}", output.display());
    }
    Ok(())
}

async fn run_analysis(
    config: &TcavConfig,
    args: &RunArgs,
    workspace: &Path,
) -> anyhow::Result<AnalysisReport> {
    let paths = config.paths.resolve(workspace);
    let table = ActivationTable::from_dir(&paths.activation_dir).with_context(|| {
        format!(
            "Failed to load activations from {}",
            paths.activation_dir.display()
        )
    })?;
    let table = Arc::new(table);

    let mut repository = ActivationRepository::new(Arc::clone(&table), table);
    if let Some(limit) = config.example_limit() {
        repository = repository.with_max_examples(limit);
    }
    if let Some(dir) = &paths.activation_cache_dir {
        repository = repository.with_cache_dir(dir);
    }
    let store = CavStore::new(JsonCavPersistence::new(&paths.cav_dir));
    let analysis = Arc::new(TcavAnalysis::from_config(config, repository, store));

    let exp = &config.experiment;
    let mut report = AnalysisReport::new(&exp.target);

    match analysis.target_prediction_rate(&exp.target) {
        Ok(rate) => println!(
            "Model predicts '{}' for {:.1}% of its examples",
            exp.target,
            rate * 100.0
        ),
        Err(TcavError::ModelUnavailable(_)) => {
            tracing::debug!("No recorded predictions; skipping accuracy check");
        }
        Err(e) => return Err(e).context("Prediction check failed"),
    }

    let target = exp.target.clone();
    let (concepts, layers) = (exp.concepts.clone(), exp.layers.clone());
    if args.significance {
        let worker = Arc::clone(&analysis);
        let (significance, results) = tokio::task::spawn_blocking(move || {
            let significance = worker.run_with_significance(&target, &concepts, &layers)?;
            // Baseline-0 CAVs are cached by now; this only rescores them.
            let results = worker.run(&target, &concepts, &layers)?;
            Ok::<_, TcavError>((significance, results))
        })
        .await??;
        report.significance = significance;
        report.results = results;
    } else if args.parallel {
        report.results = Arc::clone(&analysis)
            .run_parallel(&target, &concepts, &layers, config.runtime.workers)
            .await?;
    } else {
        let worker = Arc::clone(&analysis);
        report.results =
            tokio::task::spawn_blocking(move || worker.run(&target, &concepts, &layers)).await??;
    }

    tracing::info!(
        run_id = %report.run_id,
        results = report.results.len(),
        cache_hits = analysis.store().hits(),
        trained = analysis.store().misses(),
        "Analysis complete"
    );
    Ok(report)
}

fn print_results(results: &[TcavResult]) {
    let mut current_layer: Option<&str> = None;
    for result in results {
        if current_layer != Some(result.layer.as_str()) {
            println!("\nLayer {}", result.layer);
            current_layer = Some(result.layer.as_str());
        }
        println!(
            "  {:<20} {:.3}  (CAV accuracy {:.3})",
            result.concept, result.score, result.cav_accuracy
        );
    }
}

fn print_significance(results: &[SignificanceResult], level: f64) {
    println!("\nSignificance (level {level})");
    for result in results {
        let verdict = match result.significant {
            Some(true) => "significant",
            Some(false) => "not significant",
            None => "untested",
        };
        let p_value = result
            .p_value
            .map_or_else(|| "-".to_string(), |p| format!("{p:.4}"));
        println!(
            "  {}@{:<12} mean {:.3} ± {:.3}  p {}  {}",
            result.concept, result.layer, result.mean, result.std_dev, p_value, verdict
        );
    }
}

fn handle_cavs(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load(workspace, config_file)?;
    let paths = config.paths.resolve(workspace);
    let persistence = JsonCavPersistence::new(&paths.cav_dir);
    let cavs = persistence
        .load_all()
        .with_context(|| format!("Failed to read CAVs from {}", paths.cav_dir.display()))?;

    if cavs.is_empty() {
        println!("No cached CAVs in {}", paths.cav_dir.display());
        return Ok(());
    }
    println!("Cached CAVs ({}):", cavs.len());
    for cav in cavs {
        println!(
            "  {}  alpha {}  accuracy {:.3}  trained {}",
            cav.key(),
            cav.alpha,
            cav.accuracy,
            cav.trained_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join(WORKSPACE_CONFIG);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&config_path, TcavConfig::default().to_toml()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_file)?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
