//! Configuration for TCAV runs.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> explicit file -> environment. The CLI applies its own
//! flags on top of the extracted value.

use crate::cav::TrainerConfig;
use crate::error::{Result, TcavError};
use crate::scorer::SensitivityFrame;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Workspace-relative location of the config file.
pub const WORKSPACE_CONFIG: &str = ".tcav/config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcavConfig {
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub training: TrainerConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub significance: SignificanceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// What to analyze.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Target class whose predictions are explained.
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_concepts")]
    pub concepts: Vec<String>,
    /// Bottleneck layers to extract activations from.
    #[serde(default = "default_layers")]
    pub layers: Vec<String>,
    /// Candidate regularization strengths for CAV training.
    #[serde(default = "default_alphas")]
    pub alphas: Vec<f64>,
    /// Independent random baselines per concept for significance testing.
    #[serde(default = "default_num_random_exp")]
    pub num_random_exp: usize,
    /// Random baselines are named `{random_prefix}_{i}`.
    #[serde(default = "default_random_prefix")]
    pub random_prefix: String,
    /// Examples taken per group; 0 means no limit.
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            concepts: default_concepts(),
            layers: default_layers(),
            alphas: default_alphas(),
            num_random_exp: default_num_random_exp(),
            random_prefix: default_random_prefix(),
            max_examples: default_max_examples(),
        }
    }
}

fn default_target() -> String {
    "zebra".to_string()
}

fn default_concepts() -> Vec<String> {
    vec!["dotted".into(), "striped".into(), "zigzagged".into()]
}

fn default_layers() -> Vec<String> {
    vec!["mixed4c".into()]
}

fn default_alphas() -> Vec<f64> {
    vec![0.1]
}

fn default_num_random_exp() -> usize {
    10
}

fn default_random_prefix() -> String {
    "random500".to_string()
}

fn default_max_examples() -> usize {
    100
}

/// Filesystem locations, relative to the workspace unless absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Precomputed activations read by the CLI.
    #[serde(default = "default_activation_dir")]
    pub activation_dir: PathBuf,
    /// Where fetched activation sets are cached; unset disables caching.
    #[serde(default)]
    pub activation_cache_dir: Option<PathBuf>,
    #[serde(default = "default_cav_dir")]
    pub cav_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            activation_dir: default_activation_dir(),
            activation_cache_dir: None,
            cav_dir: default_cav_dir(),
        }
    }
}

impl PathsConfig {
    /// Anchor relative paths at `workspace`.
    pub fn resolve(&self, workspace: &Path) -> Self {
        let anchor = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                workspace.join(p)
            }
        };
        Self {
            activation_dir: anchor(&self.activation_dir),
            activation_cache_dir: self.activation_cache_dir.as_deref().map(anchor),
            cav_dir: anchor(&self.cav_dir),
        }
    }
}

fn default_activation_dir() -> PathBuf {
    PathBuf::from(".tcav/activations")
}

fn default_cav_dir() -> PathBuf {
    PathBuf::from(".tcav/cavs")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub frame: SensitivityFrame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceConfig {
    /// p-value threshold below which a concept is reported significant.
    #[serde(default = "default_level")]
    pub level: f64,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> f64 {
    0.05
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Concurrent (layer, concept) pairs in parallel mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

impl TcavConfig {
    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        let exp = &self.experiment;
        if exp.target.trim().is_empty() {
            return Err(TcavError::Config("experiment.target is empty".into()));
        }
        if exp.concepts.is_empty() {
            return Err(TcavError::Config("experiment.concepts is empty".into()));
        }
        if exp.layers.is_empty() {
            return Err(TcavError::Config("experiment.layers is empty".into()));
        }
        if exp.alphas.is_empty() || exp.alphas.iter().any(|a| !a.is_finite() || *a <= 0.0) {
            return Err(TcavError::Config(
                "experiment.alphas must be a non-empty list of positive numbers".into(),
            ));
        }
        if exp.num_random_exp == 0 {
            return Err(TcavError::Config(
                "experiment.num_random_exp must be at least 1".into(),
            ));
        }
        if self.training.max_iter == 0 {
            return Err(TcavError::Config("training.max_iter must be at least 1".into()));
        }
        let tol = self.training.tolerance;
        if !(tol.is_finite() && tol > 0.0) {
            return Err(TcavError::Config(
                "training.tolerance must be a positive number".into(),
            ));
        }
        if !(self.significance.level > 0.0 && self.significance.level < 1.0) {
            return Err(TcavError::Config("significance.level must lie in (0, 1)".into()));
        }
        if self.runtime.workers == 0 {
            return Err(TcavError::Config("runtime.workers must be at least 1".into()));
        }
        Ok(())
    }

    /// `None` when every example should be used.
    pub fn example_limit(&self) -> Option<usize> {
        (self.experiment.max_examples > 0).then_some(self.experiment.max_examples)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TcavError::Config(e.to_string()))
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`TCAV_EXPERIMENT__TARGET`, `TCAV_RUNTIME__WORKERS`, ...)
/// 2. Explicit config file
/// 3. Workspace config (`.tcav/config.toml`)
/// 4. User config (`~/.config/tcav/config.toml`)
/// 5. Built-in defaults
pub fn load_config(workspace: Option<&Path>, file: Option<&Path>) -> Result<TcavConfig> {
    let mut figment = Figment::from(Serialized::defaults(TcavConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "tcav", "tcav") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = file {
        if !file.exists() {
            return Err(TcavError::Config(format!(
                "config file {} does not exist",
                file.display()
            )));
        }
        figment = figment.merge(Toml::file(file));
    }

    figment = figment.merge(Env::prefixed("TCAV_").split("__"));

    let config: TcavConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = TcavConfig::default();
        assert_eq!(config.experiment.target, "zebra");
        assert_eq!(
            config.experiment.concepts,
            vec!["dotted", "striped", "zigzagged"]
        );
        assert_eq!(config.experiment.layers, vec!["mixed4c"]);
        assert_eq!(config.experiment.alphas, vec![0.1]);
        assert_eq!(config.experiment.num_random_exp, 10);
        assert_eq!(config.scoring.frame, SensitivityFrame::Standardized);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TcavConfig::default();
        config.experiment.alphas = vec![0.1, -1.0];
        assert!(config.validate().is_err());

        let mut config = TcavConfig::default();
        config.experiment.num_random_exp = 0;
        assert!(config.validate().is_err());

        let mut config = TcavConfig::default();
        config.significance.level = 1.5;
        assert!(config.validate().is_err());

        let mut config = TcavConfig::default();
        config.experiment.layers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_training_settings() {
        let mut config = TcavConfig::default();
        config.training.max_iter = 0;
        assert!(matches!(config.validate(), Err(TcavError::Config(_))));

        for tolerance in [0.0, -1e-4, f64::NAN, f64::INFINITY] {
            let mut config = TcavConfig::default();
            config.training.tolerance = tolerance;
            assert!(matches!(config.validate(), Err(TcavError::Config(_))));
        }

        let mut config = TcavConfig::default();
        config.training.max_iter = 1;
        config.training.tolerance = 1e-9;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_limit() {
        let mut config = TcavConfig::default();
        assert_eq!(config.example_limit(), Some(100));
        config.experiment.max_examples = 0;
        assert_eq!(config.example_limit(), None);
    }

    #[test]
    fn test_resolve_paths() {
        let paths = PathsConfig {
            activation_dir: PathBuf::from("acts"),
            activation_cache_dir: Some(PathBuf::from("/var/cache/acts")),
            cav_dir: PathBuf::from("cavs"),
        };
        let resolved = paths.resolve(Path::new("/work"));
        assert_eq!(resolved.activation_dir, PathBuf::from("/work/acts"));
        assert_eq!(
            resolved.activation_cache_dir,
            Some(PathBuf::from("/var/cache/acts"))
        );
        assert_eq!(resolved.cav_dir, PathBuf::from("/work/cavs"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TcavConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: TcavConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_workspace_file_and_env_layering() {
        Jail::expect_with(|jail| {
            std::fs::create_dir_all(jail.directory().join(".tcav")).map_err(|e| e.to_string())?;
            jail.create_file(
                WORKSPACE_CONFIG,
                r#"
[experiment]
target = "tiger"
concepts = ["striped"]
alphas = [0.01, 0.1]

[scoring]
frame = "raw"
"#,
            )?;
            jail.set_env("TCAV_RUNTIME__WORKERS", "2");
            jail.set_env("TCAV_EXPERIMENT__TARGET", "zebra");

            let config = load_config(Some(jail.directory()), None)
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.experiment.target, "zebra");
            assert_eq!(config.experiment.concepts, vec!["striped"]);
            assert_eq!(config.experiment.alphas, vec![0.01, 0.1]);
            assert_eq!(config.experiment.layers, vec!["mixed4c"]);
            assert_eq!(config.scoring.frame, SensitivityFrame::Raw);
            assert_eq!(config.runtime.workers, 2);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.toml", "[runtime]\nworkers = 0\n")?;
            let path = jail.directory().join("bad.toml");
            let result = load_config(None, Some(&path));
            assert!(matches!(result, Err(TcavError::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = load_config(None, Some(Path::new("/nonexistent/tcav.toml")));
        assert!(matches!(result, Err(TcavError::Config(_))));
    }
}
