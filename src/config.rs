// Run configuration: TOML file merged with command-line overrides

use std::path::{Path, PathBuf};
use chrono::FixedOffset;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::catalog::albums::AlbumFilter;
use crate::catalog::discover::MediaExtensions;
use crate::catalog::matching::MatchPolicy;
use crate::constants::{
    CONFIG_FILENAME, DEFAULT_ALBUM_ROOTS, DEFAULT_EDITED_SUFFIXES, DEFAULT_FUZZY_MIN_PREFIX,
    DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_IMPORT_BATCH_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS, DEFAULT_WORKERS,
};
use crate::error::{MigrateError, Result};
use crate::pipeline::Phase;

/// Which phases a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Extract archives only
    Extract,
    /// Match sidecars and embed metadata only
    Metadata,
    /// Import the output tree only
    Import,
    /// All three phases
    All,
    /// All three phases as a dry run
    Test,
}

impl RunMode {
    pub fn phases(self) -> &'static [Phase] {
        match self {
            RunMode::Extract => &[Phase::Extract],
            RunMode::Metadata => &[Phase::Metadata],
            RunMode::Import => &[Phase::Import],
            RunMode::All | RunMode::Test => &[Phase::Extract, Phase::Metadata, Phase::Import],
        }
    }

    pub fn includes(self, phase: Phase) -> bool {
        self.phases().contains(&phase)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Extract => "extract",
            RunMode::Metadata => "metadata",
            RunMode::Import => "import",
            RunMode::All => "all",
            RunMode::Test => "test",
        }
    }
}

/// What to do when the destination application stops responding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    #[default]
    Retry,
    Prompt,
    Abort,
}

/// How the import phase hands files to the import tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    /// One invocation per item
    #[default]
    PerFile,
    /// One invocation per group of items sharing the same albums, read back
    /// through the tool's import report
    Batch,
}

// --- File config (every field optional) ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub source_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub album_filter: Vec<String>,
    pub album_exclude: Vec<String>,
    pub phase: Option<RunMode>,
    pub dry_run: Option<bool>,
    pub workers: Option<usize>,
    pub delete_after_import: Option<bool>,
    pub skip_unmatched: Option<bool>,
    pub import_strategy: Option<ImportStrategy>,
    pub import_batch_size: Option<usize>,
    pub include_auto_albums: Option<bool>,
    pub album_roots: Option<Vec<String>>,
    pub matching: MatchingFileConfig,
    pub tools: ToolsFileConfig,
    pub monitoring: MonitoringFileConfig,
    pub extensions: ExtensionsFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingFileConfig {
    pub fuzzy_min_prefix: Option<usize>,
    pub truncated_min_len: Option<usize>,
    pub edited_suffixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsFileConfig {
    pub exiftool: Option<PathBuf>,
    pub import_tool: Option<PathBuf>,
    pub health_command: Option<Vec<String>>,
    pub restart_command: Option<Vec<String>>,
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringFileConfig {
    pub health_check_interval: Option<usize>,
    pub on_unavailable: Option<UnavailablePolicy>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtensionsFileConfig {
    pub image: Option<Vec<String>>,
    pub video: Option<Vec<String>>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub source_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub phase: Option<RunMode>,
    pub dry_run: bool,
    pub albums: Vec<String>,
    pub exclude_albums: Vec<String>,
    pub workers: Option<usize>,
}

// --- Resolved settings ---

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub exiftool: PathBuf,
    pub import_tool: PathBuf,
    pub health_command: Option<Vec<String>>,
    pub restart_command: Option<Vec<String>>,
    /// None means the local offset at each capture instant
    pub utc_offset: Option<FixedOffset>,
}

#[derive(Debug, Clone)]
pub struct MonitoringSettings {
    pub health_check_interval: usize,
    pub on_unavailable: UnavailablePolicy,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            on_unavailable: UnavailablePolicy::Retry,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub source_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mode: RunMode,
    pub dry_run: bool,
    pub workers: usize,
    pub album_filter: AlbumFilter,
    pub delete_after_import: bool,
    pub skip_unmatched: bool,
    pub import_strategy: ImportStrategy,
    /// Most files per invocation with the batch strategy
    pub import_batch_size: usize,
    pub album_roots: Vec<String>,
    pub matching: MatchPolicy,
    pub tools: ToolSettings,
    pub monitoring: MonitoringSettings,
    pub extensions: MediaExtensions,
}

impl Settings {
    /// Settings with defaults for everything but the three directories.
    pub fn with_dirs(source_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            work_dir: work_dir.into(),
            output_dir: output_dir.into(),
            mode: RunMode::All,
            dry_run: false,
            workers: DEFAULT_WORKERS,
            album_filter: AlbumFilter::default(),
            delete_after_import: false,
            skip_unmatched: false,
            import_strategy: ImportStrategy::PerFile,
            import_batch_size: DEFAULT_IMPORT_BATCH_SIZE,
            album_roots: DEFAULT_ALBUM_ROOTS.iter().map(|s| s.to_string()).collect(),
            matching: MatchPolicy::default(),
            tools: ToolSettings {
                exiftool: crate::tools::exiftool_path(None),
                import_tool: crate::tools::import_tool_path(None),
                health_command: None,
                restart_command: None,
                utc_offset: None,
            },
            monitoring: MonitoringSettings::default(),
            extensions: MediaExtensions::default(),
        }
    }

    /// Merge file config and CLI overrides, then validate.
    pub fn resolve(file: FileConfig, cli: CliOverrides) -> Result<Self> {
        let source_dir = cli.source_dir.or(file.source_dir)
            .ok_or_else(|| MigrateError::Configuration("source_dir is not set".to_string()))?;
        let work_dir = cli.work_dir.or(file.work_dir)
            .ok_or_else(|| MigrateError::Configuration("work_dir is not set".to_string()))?;
        let output_dir = cli.output_dir.or(file.output_dir)
            .ok_or_else(|| MigrateError::Configuration("output_dir is not set".to_string()))?;

        let mut settings = Settings::with_dirs(source_dir, work_dir, output_dir);

        settings.mode = cli.phase.or(file.phase).unwrap_or(RunMode::All);
        settings.dry_run = cli.dry_run || file.dry_run.unwrap_or(false) || settings.mode == RunMode::Test;
        settings.workers = cli.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
        settings.delete_after_import = file.delete_after_import.unwrap_or(false);
        settings.skip_unmatched = file.skip_unmatched.unwrap_or(false);
        settings.import_strategy = file.import_strategy.unwrap_or_default();
        settings.import_batch_size = file.import_batch_size.unwrap_or(DEFAULT_IMPORT_BATCH_SIZE);

        let include = if cli.albums.is_empty() { file.album_filter } else { cli.albums };
        let mut exclude = file.album_exclude;
        exclude.extend(cli.exclude_albums);
        settings.album_filter = AlbumFilter::new(&include, &exclude, file.include_auto_albums.unwrap_or(false));

        if let Some(roots) = file.album_roots {
            settings.album_roots = roots;
        }

        settings.matching = MatchPolicy {
            fuzzy_min_prefix: file.matching.fuzzy_min_prefix.unwrap_or(DEFAULT_FUZZY_MIN_PREFIX),
            truncated_min_len: file.matching.truncated_min_len
                .unwrap_or(settings.matching.truncated_min_len),
            edited_suffixes: file.matching.edited_suffixes
                .unwrap_or_else(|| DEFAULT_EDITED_SUFFIXES.iter().map(|s| s.to_string()).collect()),
        };

        let utc_offset = match file.tools.utc_offset_minutes {
            Some(minutes) => Some(FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
                MigrateError::Configuration(format!("utc_offset_minutes out of range: {}", minutes))
            })?),
            None => None,
        };
        settings.tools = ToolSettings {
            exiftool: crate::tools::exiftool_path(file.tools.exiftool.as_deref()),
            import_tool: crate::tools::import_tool_path(file.tools.import_tool.as_deref()),
            health_command: file.tools.health_command,
            restart_command: file.tools.restart_command,
            utc_offset,
        };

        let defaults = MonitoringSettings::default();
        settings.monitoring = MonitoringSettings {
            health_check_interval: file.monitoring.health_check_interval.unwrap_or(defaults.health_check_interval),
            on_unavailable: file.monitoring.on_unavailable.unwrap_or(defaults.on_unavailable),
            max_retries: file.monitoring.max_retries.unwrap_or(defaults.max_retries),
            retry_delay_secs: file.monitoring.retry_delay_secs.unwrap_or(defaults.retry_delay_secs),
        };

        if let Some(image) = file.extensions.image {
            settings.extensions.image = normalize_extensions(image);
        }
        if let Some(video) = file.extensions.video {
            settings.extensions.video = normalize_extensions(video);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would make any phase misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(MigrateError::Configuration("workers must be at least 1".to_string()));
        }
        if self.monitoring.health_check_interval == 0 {
            return Err(MigrateError::Configuration("health_check_interval must be at least 1".to_string()));
        }
        if self.import_batch_size == 0 {
            return Err(MigrateError::Configuration("import_batch_size must be at least 1".to_string()));
        }
        if self.mode.includes(Phase::Extract) && !self.source_dir.is_dir() {
            return Err(MigrateError::Configuration(format!(
                "source_dir does not exist: {}",
                self.source_dir.display()
            )));
        }
        if !self.mode.includes(Phase::Extract) && !self.work_dir.is_dir() {
            return Err(MigrateError::Configuration(format!(
                "work_dir does not exist: {} (run the extract phase first)",
                self.work_dir.display()
            )));
        }
        if paths_overlap(&self.work_dir, &self.output_dir) {
            return Err(MigrateError::Configuration(
                "work_dir and output_dir must not contain each other".to_string(),
            ));
        }
        if same_path(&self.source_dir, &self.work_dir) {
            return Err(MigrateError::Configuration(
                "source_dir and work_dir must differ".to_string(),
            ));
        }
        if self.extensions.image.is_empty() && self.extensions.video.is_empty() {
            return Err(MigrateError::Configuration("no media extensions configured".to_string()));
        }
        Ok(())
    }
}

fn normalize_extensions(exts: Vec<String>) -> Vec<String> {
    exts.into_iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn paths_overlap(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a.starts_with(&b) || b.starts_with(&a)
}

fn same_path(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a == b
}

/// Find the config file: explicit path, then ./config.toml, then the
/// platform config directory. Returns the parsed file and where it came from.
pub fn load_file_config(explicit: Option<&Path>) -> Result<(FileConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(p) => {
            if !p.is_file() {
                return Err(MigrateError::Configuration(format!("config file not found: {}", p.display())));
            }
            Some(p.to_path_buf())
        }
        None => default_config_candidates().into_iter().find(|p| p.is_file()),
    };

    match path {
        Some(p) => {
            let contents = std::fs::read_to_string(&p)?;
            let config: FileConfig = toml::from_str(&contents)?;
            Ok((config, Some(p)))
        }
        None => Ok((FileConfig::default(), None)),
    }
}

fn default_config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(CONFIG_FILENAME)];
    if let Some(dirs) = directories::ProjectDirs::from("", "", "takeout-migrate") {
        candidates.push(dirs.config_dir().join(CONFIG_FILENAME));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dirs() -> (TempDir, CliOverrides) {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("zips");
        let work = tmp.path().join("work");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&work).unwrap();
        let cli = CliOverrides {
            source_dir: Some(source),
            work_dir: Some(work),
            output_dir: Some(tmp.path().join("out")),
            ..Default::default()
        };
        (tmp, cli)
    }

    #[test]
    fn test_parse_full_file() {
        let toml_src = r#"
            source_dir = "/takeout"
            work_dir = "/work"
            output_dir = "/out"
            album_filter = ["Urlaub 2023"]
            phase = "metadata"
            dry_run = true
            workers = 2
            import_strategy = "batch"
            import_batch_size = 50

            [matching]
            fuzzy_min_prefix = 14

            [tools]
            exiftool = "/opt/bin/exiftool"
            health_command = ["pgrep", "-x", "Photos"]
            utc_offset_minutes = 60

            [monitoring]
            on_unavailable = "prompt"
            max_retries = 5

            [extensions]
            image = [".JPG", "heic"]
        "#;
        let config: FileConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.phase, Some(RunMode::Metadata));
        assert_eq!(config.album_filter, vec!["Urlaub 2023".to_string()]);
        assert_eq!(config.import_strategy, Some(ImportStrategy::Batch));
        assert_eq!(config.import_batch_size, Some(50));
        assert_eq!(config.matching.fuzzy_min_prefix, Some(14));
        assert_eq!(config.monitoring.on_unavailable, Some(UnavailablePolicy::Prompt));
        assert_eq!(config.tools.health_command.as_ref().map(|c| c.len()), Some(3));
        assert_eq!(normalize_extensions(config.extensions.image.unwrap()), vec!["jpg", "heic"]);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result: std::result::Result<FileConfig, _> = toml::from_str("sorce_dir = \"/x\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let (_tmp, mut cli) = dirs();
        cli.phase = Some(RunMode::Extract);
        cli.workers = Some(8);
        let file = FileConfig {
            phase: Some(RunMode::Import),
            workers: Some(1),
            ..Default::default()
        };
        let settings = Settings::resolve(file, cli).unwrap();
        assert_eq!(settings.mode, RunMode::Extract);
        assert_eq!(settings.workers, 8);
        assert!(!settings.dry_run);
    }

    #[test]
    fn test_test_mode_forces_dry_run() {
        let (_tmp, mut cli) = dirs();
        cli.phase = Some(RunMode::Test);
        let settings = Settings::resolve(FileConfig::default(), cli).unwrap();
        assert!(settings.dry_run);
        assert_eq!(settings.mode.phases().len(), 3);
    }

    #[test]
    fn test_missing_dirs_are_configuration_errors() {
        let err = Settings::resolve(FileConfig::default(), CliOverrides::default()).unwrap_err();
        assert!(err.is_fatal());

        let (tmp, mut cli) = dirs();
        cli.source_dir = Some(tmp.path().join("missing"));
        let err = Settings::resolve(FileConfig::default(), cli).unwrap_err();
        assert!(matches!(err, MigrateError::Configuration(_)));
    }

    #[test]
    fn test_output_inside_work_dir_rejected() {
        let (_tmp, mut cli) = dirs();
        cli.output_dir = Some(cli.work_dir.clone().unwrap().join("out"));
        let err = Settings::resolve(FileConfig::default(), cli).unwrap_err();
        assert!(matches!(err, MigrateError::Configuration(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let (_tmp, mut cli) = dirs();
        cli.workers = Some(0);
        assert!(Settings::resolve(FileConfig::default(), cli).is_err());
    }

    #[test]
    fn test_import_strategy_defaults_to_per_file() {
        let (_tmp, cli) = dirs();
        let settings = Settings::resolve(FileConfig::default(), cli.clone()).unwrap();
        assert_eq!(settings.import_strategy, ImportStrategy::PerFile);
        assert_eq!(settings.import_batch_size, DEFAULT_IMPORT_BATCH_SIZE);

        let file = FileConfig {
            import_batch_size: Some(0),
            ..Default::default()
        };
        assert!(Settings::resolve(file, cli).is_err());
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let err = load_file_config(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert!(matches!(err, MigrateError::Configuration(_)));
    }
}
