//! Layered configuration (CLI > environment > config file > defaults),
//! `${VAR}` interpolation, credential resolution, and log redaction
//! pattern storage for `polaris-device-subclient`.

mod error;
mod interpolate;

pub use error::ConfigError;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use polaris_core::redact::Redactor;
use polaris_core::writer::OutputMode;
use polaris_core::{FilterConfig, WriterConfig};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use interpolate::interpolate;

const DEFAULT_CONFIG_PATH: &str = "/etc/polaris/polaris-device-subclient.toml";

/// Top-level configuration. Unknown keys here are a hard validation error;
/// unknown keys inside `polaris`, `output`, `logging`, `filter` are
/// warnings only (spec §6), enforced separately in [`validate_keys`]
/// rather than via `#[serde(deny_unknown_fields)]` on the nested structs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub polaris: PolarisSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub filter: FilterSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polaris: PolarisSection::default(),
            output: OutputSection::default(),
            logging: LoggingSection::default(),
            filter: FilterSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolarisSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

impl Default for PolarisSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            instance_id: default_instance_id(),
            reconnect: ReconnectSection::default(),
        }
    }
}

fn default_api_url() -> String {
    "wss://api.polaris.example.com/graphql".into()
}
fn default_instance_id() -> String {
    "default".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_pct() -> f64 {
    20.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSection {
    #[serde(default = "default_output_mode")]
    pub mode: String,
    #[serde(default)]
    pub file: FileSection,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self { mode: default_output_mode(), file: FileSection::default() }
    }
}

fn default_output_mode() -> String {
    "file".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSection {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default)]
    pub rotate: RotateSection,
    #[serde(default)]
    pub flush: FlushSection,
}

impl Default for FileSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_prefix: default_file_prefix(),
            rotate: RotateSection::default(),
            flush: FlushSection::default(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/var/lib/polaris-device-subclient/output")
}
fn default_file_prefix() -> String {
    "polaris".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RotateSection {
    #[serde(default = "default_rotate_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_rotate_max_size_bytes")]
    pub max_size_bytes: u64,
}

impl Default for RotateSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_rotate_interval_seconds(),
            max_size_bytes: default_rotate_max_size_bytes(),
        }
    }
}

fn default_rotate_interval_seconds() -> u64 {
    3600
}
fn default_rotate_max_size_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlushSection {
    #[serde(default = "default_flush_every_n_events")]
    pub every_n_events: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub interval_ms: u64,
}

impl Default for FlushSection {
    fn default() -> Self {
        Self { every_n_events: default_flush_every_n_events(), interval_ms: default_flush_interval_ms() }
    }
}

fn default_flush_every_n_events() -> u64 {
    50
}
fn default_flush_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,
    pub operational_log_path: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            redact_patterns: default_redact_patterns(),
            operational_log_path: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_redact_patterns() -> Vec<String> {
    vec!["*api_key*".into(), "*token*".into(), "*password*".into(), "*secret*".into()]
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterSection {
    #[serde(default)]
    pub drop_states: Vec<String>,
    #[serde(default)]
    pub drop_device_ids: Vec<String>,
    #[serde(default)]
    pub keep_device_ids: Vec<String>,
}

/// Resolves the config file path: explicit CLI path, else `POLARIS_CONFIG`,
/// else the process supervisor's conventional install path.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map(Path::to_path_buf).unwrap_or_else(|| {
        std::env::var("POLARIS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    })
}

/// Builds the layered `Figment`: defaults, then the config file (if it
/// exists, after `${VAR}` interpolation). The `POLARIS_*` environment
/// variables named in the CLI/env table (spec §6) are *not* merged in
/// here as a generic prefixed provider: every one of them already has an
/// owner -- `clap`'s `env = "POLARIS_..."` attributes on the matching CLI
/// flags, or a direct `std::env::var` read in [`resolve_api_key`] -- and a
/// blind `Env::prefixed("POLARIS_").split("_")` would fold e.g.
/// `POLARIS_API_KEY` into a bogus top-level `api` section, tripping
/// [`validate_keys`] on every invocation that sets credentials via
/// environment. CLI overrides are merged by the caller as one more
/// `Serialized` layer on top, since CLI parsing lives in the bin crate.
pub fn load_figment(config_path: &Path) -> Result<Figment, ConfigError> {
    let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

    if config_path.exists() {
        let raw = std::fs::read_to_string(config_path)?;
        let interpolated = interpolate(&raw)?;
        figment = figment.merge(Toml::string(&interpolated));
    }

    Ok(figment)
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["polaris", "output", "logging", "filter"];
const KNOWN_POLARIS_KEYS: &[&str] = &["api_url", "api_key", "instance_id", "reconnect"];
const KNOWN_OUTPUT_KEYS: &[&str] = &["mode", "file"];
const KNOWN_LOGGING_KEYS: &[&str] = &["level", "redact_patterns", "operational_log_path"];
const KNOWN_FILTER_KEYS: &[&str] = &["drop_states", "drop_device_ids", "keep_device_ids"];

/// Extracts `Config` from `figment`, enforcing spec §6's asymmetric key
/// policy: an unrecognized top-level key is a hard error; an unrecognized
/// key nested under a known section is logged as a warning and otherwise
/// ignored.
pub fn finalize(figment: &Figment) -> Result<Config, ConfigError> {
    let raw: serde_json::Value = figment.extract()?;
    validate_keys(&raw)?;
    let config: Config = figment.extract()?;
    Ok(config)
}

fn validate_keys(raw: &serde_json::Value) -> Result<(), ConfigError> {
    let serde_json::Value::Object(top) = raw else { return Ok(()) };

    let unknown_top: Vec<&str> =
        top.keys().map(String::as_str).filter(|k| !KNOWN_TOP_LEVEL_KEYS.contains(k)).collect();
    if !unknown_top.is_empty() {
        return Err(ConfigError::UnknownTopLevelKeys(unknown_top.join(", ")));
    }

    warn_unknown_nested(top, "polaris", KNOWN_POLARIS_KEYS);
    warn_unknown_nested(top, "output", KNOWN_OUTPUT_KEYS);
    warn_unknown_nested(top, "logging", KNOWN_LOGGING_KEYS);
    warn_unknown_nested(top, "filter", KNOWN_FILTER_KEYS);
    Ok(())
}

fn warn_unknown_nested(top: &serde_json::Map<String, serde_json::Value>, section: &str, known: &[&str]) {
    let Some(serde_json::Value::Object(nested)) = top.get(section) else { return };
    let unknown: HashSet<&str> =
        nested.keys().map(String::as_str).filter(|k| !known.contains(k)).collect();
    for key in unknown {
        tracing::warn!(section, key, "unknown configuration key, ignoring");
    }
}

/// Parses `polaris.api_url` (after any CLI override) as a URL, so
/// `--validate-config` and `--dry-run` fail fast on a malformed endpoint
/// before ever touching the network.
pub fn validate_api_url(config: &Config, cli_override: Option<&str>) -> Result<url::Url, ConfigError> {
    let raw = cli_override.unwrap_or(config.polaris.api_url.as_str());
    raw.parse().map_err(|e| ConfigError::Validation {
        field: "polaris.api_url".into(),
        reason: format!("invalid URL '{raw}': {e}"),
    })
}

/// Credential resolution order (spec §6): `--polaris-api-key` CLI flag,
/// `POLARIS_API_KEY`, `POLARIS_KEY_FILE` (path to a file whose contents
/// are the key), then `polaris.api_key` in the config file.
pub fn resolve_api_key(config: &Config, cli_override: Option<&str>) -> Result<SecretString, ConfigError> {
    if let Some(key) = cli_override {
        return Ok(SecretString::from(key.to_string()));
    }
    if let Ok(key) = std::env::var("POLARIS_API_KEY") {
        return Ok(SecretString::from(key));
    }
    if let Ok(path) = std::env::var("POLARIS_KEY_FILE") {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::KeyFile { path: path.clone(), source: e })?;
        return Ok(SecretString::from(contents.trim().to_string()));
    }
    if let Some(key) = &config.polaris.api_key {
        return Ok(SecretString::from(key.clone()));
    }
    Err(ConfigError::NoCredentials)
}

/// Translates the `output`/`filter`/`logging` sections into the plain data
/// `polaris-core` consumes, keeping `polaris-config` as the only place that
/// knows about on-disk/env layering. `output_dir_override` and
/// `mode_override` correspond to `--output-dir` and `--output`.
pub fn to_writer_config(
    config: &Config,
    output_dir_override: Option<PathBuf>,
    mode_override: Option<&str>,
) -> Result<WriterConfig, ConfigError> {
    let mode_str = mode_override.unwrap_or(config.output.mode.as_str());
    let mode = match mode_str {
        "stdout" => OutputMode::Stdout,
        "file" => OutputMode::File,
        other => {
            return Err(ConfigError::Validation {
                field: "output.mode".into(),
                reason: format!("expected 'stdout' or 'file', got '{other}'"),
            })
        }
    };

    Ok(WriterConfig {
        mode,
        output_dir: output_dir_override.unwrap_or_else(|| config.output.file.output_dir.clone()),
        file_prefix: config.output.file.file_prefix.clone(),
        instance_id: config.polaris.instance_id.clone(),
        rotate_interval: std::time::Duration::from_secs(config.output.file.rotate.interval_seconds),
        rotate_max_size_bytes: config.output.file.rotate.max_size_bytes,
        flush_every_n_events: config.output.file.flush.every_n_events,
        flush_interval: std::time::Duration::from_millis(config.output.file.flush.interval_ms),
    })
}

#[must_use]
pub fn to_filter_config(config: &Config) -> FilterConfig {
    FilterConfig {
        drop_states: config.filter.drop_states.iter().cloned().collect(),
        drop_device_ids: config.filter.drop_device_ids.iter().cloned().collect(),
        keep_device_ids: config.filter.keep_device_ids.iter().cloned().collect(),
    }
}

#[must_use]
pub fn to_redactor(config: &Config) -> Redactor {
    Redactor::new(config.logging.redact_patterns.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_load_without_a_config_file() {
        let figment = load_figment(Path::new("/nonexistent/polaris.toml")).unwrap();
        let config = finalize(&figment).unwrap();
        assert_eq!(config.polaris.instance_id, "default");
        assert_eq!(config.output.mode, "file");
    }

    #[test]
    fn config_file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("polaris.toml");
        std::fs::write(&path, "[polaris]\ninstance_id = \"writer-01\"\n").unwrap();

        let figment = load_figment(&path).unwrap();
        let config = finalize(&figment).unwrap();
        assert_eq!(config.polaris.instance_id, "writer-01");
    }

    #[test]
    fn unknown_top_level_key_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("polaris.toml");
        std::fs::write(&path, "[bogus]\nx = 1\n").unwrap();

        let figment = load_figment(&path).unwrap();
        let err = finalize(&figment).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTopLevelKeys(_)));
    }

    #[test]
    fn unknown_nested_key_is_accepted_not_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("polaris.toml");
        std::fs::write(&path, "[polaris]\ninstance_id = \"writer-01\"\nbogus_nested_key = 1\n").unwrap();

        let figment = load_figment(&path).unwrap();
        let config = finalize(&figment).unwrap();
        assert_eq!(config.polaris.instance_id, "writer-01");
    }

    #[test]
    fn interpolation_runs_before_toml_parsing() {
        std::env::set_var("POLARIS_TEST_INSTANCE", "interpolated-id");
        let dir = tempdir().unwrap();
        let path = dir.path().join("polaris.toml");
        std::fs::write(&path, "[polaris]\ninstance_id = \"${POLARIS_TEST_INSTANCE}\"\n").unwrap();

        let figment = load_figment(&path).unwrap();
        let config = finalize(&figment).unwrap();
        assert_eq!(config.polaris.instance_id, "interpolated-id");
        std::env::remove_var("POLARIS_TEST_INSTANCE");
    }

    #[test]
    fn resolve_api_key_prefers_cli_override() {
        let config = Config::default();
        let key = resolve_api_key(&config, Some("cli-key")).unwrap();
        assert_eq!(secrecy::ExposeSecret::expose_secret(&key), "cli-key");
    }

    #[test]
    fn resolve_api_key_falls_back_to_config_file() {
        let mut config = Config::default();
        config.polaris.api_key = Some("file-key".into());
        std::env::remove_var("POLARIS_API_KEY");
        std::env::remove_var("POLARIS_KEY_FILE");
        let key = resolve_api_key(&config, None).unwrap();
        assert_eq!(secrecy::ExposeSecret::expose_secret(&key), "file-key");
    }

    #[test]
    fn resolve_api_key_errors_with_no_credentials_anywhere() {
        let config = Config::default();
        std::env::remove_var("POLARIS_API_KEY");
        std::env::remove_var("POLARIS_KEY_FILE");
        let err = resolve_api_key(&config, None).unwrap_err();
        assert!(matches!(err, ConfigError::NoCredentials));
    }

    #[test]
    fn to_writer_config_honors_cli_overrides() {
        let config = Config::default();
        let writer_config =
            to_writer_config(&config, Some(PathBuf::from("/tmp/override")), Some("stdout")).unwrap();
        assert_eq!(writer_config.mode, OutputMode::Stdout);
        assert_eq!(writer_config.output_dir, PathBuf::from("/tmp/override"));
    }

    #[test]
    fn to_writer_config_rejects_unknown_mode() {
        let config = Config::default();
        let err = to_writer_config(&config, None, Some("carrier-pigeon")).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn validate_api_url_rejects_garbage() {
        let config = Config::default();
        let err = validate_api_url(&config, Some("not a url")).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn validate_api_url_accepts_wss_scheme() {
        let config = Config::default();
        let url = validate_api_url(&config, Some("wss://example.com/graphql")).unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn to_filter_config_copies_all_three_lists() {
        let mut config = Config::default();
        config.filter.drop_states = vec!["UNDEFINED".into()];
        config.filter.keep_device_ids = vec!["d1".into()];
        let filter_config = to_filter_config(&config);
        assert!(filter_config.drop_states.contains("UNDEFINED"));
        assert!(filter_config.keep_device_ids.contains("d1"));
    }
}
