//! Collector configuration
//!
//! One TOML file describes the fleet, the shared query list and the result
//! destination. Instances and queries may also live in side files that are
//! appended to the inline lists.
//!
//! ```toml
//! max_parallelism = 8
//! instances_file = "instances.toml"
//!
//! [logging]
//! level = "info"
//!
//! [[queries]]
//! request_id = "cpu"
//! query_text = "SELECT ..."
//!
//! [destination]
//! type = "metrics_push"
//! url = "http://vm:8428/api/v1/import/prometheus"
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::observability::LoggingConfig;
use crate::types::{Credentials, InstanceAddress, InstanceDescriptor, QueryDescriptor};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "MSSQL_COLLECTOR_CONFIG";

/// Configuration file used when nothing else is given
pub const DEFAULT_CONFIG_FILE: &str = "collector.toml";

// ============================================================================
// Top level
// ============================================================================

/// Complete collector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Upper bound on concurrently polled instances
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Connect + login bound per instance, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Side file with additional `[[instances]]`
    #[serde(default)]
    pub instances_file: Option<PathBuf>,

    /// Side file with additional `[[queries]]`
    #[serde(default)]
    pub queries_file: Option<PathBuf>,

    /// Logging setup
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Instances to poll
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Queries applied to every instance, in execution order
    #[serde(default)]
    pub queries: Vec<QueryDescriptor>,

    /// Result destination
    #[serde(default)]
    pub destination: SinkConfiguration,
}

fn default_max_parallelism() -> usize {
    8
}

fn default_connect_timeout_secs() -> u64 {
    15
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            connect_timeout_secs: default_connect_timeout_secs(),
            instances_file: None,
            queries_file: None,
            logging: LoggingConfig::default(),
            instances: Vec::new(),
            queries: Vec::new(),
            destination: SinkConfiguration::default(),
        }
    }
}

#[derive(Deserialize)]
struct InstancesFile {
    #[serde(default)]
    instances: Vec<InstanceConfig>,
}

#[derive(Deserialize)]
struct QueriesFile {
    #[serde(default)]
    queries: Vec<QueryDescriptor>,
}

impl CollectorConfig {
    /// Configuration file to use: CLI argument, then environment, then default
    pub fn resolve_path(cli_arg: Option<String>, env_value: Option<String>) -> PathBuf {
        cli_arg
            .filter(|s| !s.trim().is_empty())
            .or(env_value.filter(|s| !s.trim().is_empty()))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Parse a configuration document
    pub fn from_toml_str(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Load, merge side files and validate
    ///
    /// Relative side-file paths are resolved against the directory of `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: CollectorConfig = read_toml(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        if let Some(file) = &config.instances_file {
            let extra: InstancesFile = read_toml(&base.join(file))?;
            config.instances.extend(extra.instances);
        }
        if let Some(file) = &config.queries_file {
            let extra: QueriesFile = read_toml(&base.join(file))?;
            config.queries.extend(extra.queries);
        }

        config.validate()?;
        info!(
            path = %path.display(),
            instances = config.instances.len(),
            queries = config.queries.len(),
            destination = config.destination.kind(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Check values that cannot be expressed in the schema
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, query) in self.queries.iter().enumerate() {
            if query.request_id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "query #{} has an empty request_id",
                    i + 1
                )));
            }
            if query.query_text.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "query '{}' has an empty query_text",
                    query.request_id
                )));
            }
            if !seen.insert(query.request_id.as_str()) {
                warn!(request_id = %query.request_id, "Duplicate request_id in query list");
            }
        }

        self.destination.validate()
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Instance descriptors, skipping entries without `ci` or `host`
    pub fn instance_descriptors(&self) -> Vec<InstanceDescriptor> {
        self.instances
            .iter()
            .enumerate()
            .filter_map(|(i, instance)| match instance.to_descriptor() {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    error!(index = i + 1, ci = %instance.ci, error = %e, "Skipping instance");
                    None
                }
            })
            .collect()
    }
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

// ============================================================================
// Instances
// ============================================================================

/// One `[[instances]]` entry
#[derive(Clone, Deserialize)]
pub struct InstanceConfig {
    /// Instance identifier
    #[serde(default)]
    pub ci: String,
    /// Host name or IP
    #[serde(default)]
    pub host: String,
    /// TCP port
    #[serde(default)]
    pub port: Option<u16>,
    /// Named instance, used when `port` is absent
    #[serde(default)]
    pub instance_name: Option<String>,
    /// SQL login
    #[serde(default)]
    pub user: String,
    /// Password; blank means "resolve at startup"
    #[serde(default)]
    pub password: String,
    /// Labels attached to every metric of this instance, in file order
    #[serde(default)]
    pub extra_labels: toml::Table,
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("ci", &self.ci)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("instance_name", &self.instance_name)
            .field("user", &self.user)
            .field("password", &"***")
            .field("extra_labels", &self.extra_labels)
            .finish()
    }
}

impl InstanceConfig {
    /// Convert to a descriptor
    pub fn to_descriptor(&self) -> Result<InstanceDescriptor, ConfigError> {
        let ci = self.ci.trim();
        if ci.is_empty() {
            return Err(ConfigError::Invalid("instance without ci".to_string()));
        }
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!("instance {} has no host", ci)));
        }

        let address = InstanceAddress {
            host: host.to_string(),
            port: self.port,
            instance_name: self
                .instance_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };
        let mut descriptor = InstanceDescriptor::new(
            ci,
            address,
            Credentials::new(self.user.trim(), self.password.clone()),
        );

        for (key, value) in &self.extra_labels {
            let text = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(n) => n.to_string(),
                toml::Value::Float(x) => x.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Datetime(d) => d.to_string(),
                toml::Value::Array(_) | toml::Value::Table(_) => {
                    warn!(ci = %ci, label = %key, "Ignoring non-scalar extra label");
                    continue;
                }
            };
            descriptor.push_label(key.clone(), text);
        }

        Ok(descriptor)
    }
}

// ============================================================================
// Destination
// ============================================================================

/// `type = "file"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileDestination {
    /// Directory that receives the per-run output directory
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

/// `type = "database_callback"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallbackDestination {
    /// ADO-style connection string of the callback server
    #[serde(default)]
    pub connection_string: String,
    /// Routine name or full statement
    #[serde(default)]
    pub routine: String,
}

/// `type = "metrics_push"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricsPushDestination {
    /// Import endpoint
    #[serde(default)]
    pub url: String,
    /// Column holding the metric name
    #[serde(default = "default_name_column")]
    pub name_column: String,
    /// Column holding the sample value
    #[serde(default = "default_value_column")]
    pub value_column: String,
    /// Also push the collector's own run metrics after the run
    #[serde(default)]
    pub push_run_metrics: bool,
}

fn default_name_column() -> String {
    "metric_name".to_string()
}

fn default_value_column() -> String {
    "metric_value".to_string()
}

/// Result destination, selected by the `type` key
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "toml::Table")]
pub enum SinkConfiguration {
    /// JSON documents on disk
    File(FileDestination),
    /// Stored routine on a separate server
    DatabaseCallback(CallbackDestination),
    /// Prometheus text over HTTP
    MetricsPush(MetricsPushDestination),
    /// A type this build does not know; outcomes are dropped
    Unimplemented {
        /// The configured type name
        kind: String,
    },
}

impl Default for SinkConfiguration {
    fn default() -> Self {
        SinkConfiguration::File(FileDestination {
            directory: default_directory(),
        })
    }
}

impl TryFrom<toml::Table> for SinkConfiguration {
    type Error = String;

    fn try_from(table: toml::Table) -> Result<Self, Self::Error> {
        let kind = match table.get("type") {
            None => "file".to_string(),
            Some(toml::Value::String(s)) => s.trim().to_string(),
            Some(other) => {
                return Err(format!(
                    "destination type must be a string, found {}",
                    other.type_str()
                ))
            }
        };

        let value = toml::Value::Table(table);
        let parsed = match kind.to_ascii_lowercase().as_str() {
            "file" | "local_file" => value.try_into().map(SinkConfiguration::File),
            "database_callback" | "mssql" => {
                value.try_into().map(SinkConfiguration::DatabaseCallback)
            }
            "metrics_push" | "prometheus" | "victoria_metrics" => {
                value.try_into().map(SinkConfiguration::MetricsPush)
            }
            _ => return Ok(SinkConfiguration::Unimplemented { kind }),
        };
        parsed.map_err(|e| format!("invalid {} destination: {}", kind, e))
    }
}

impl SinkConfiguration {
    /// Short name used in logs
    pub fn kind(&self) -> &str {
        match self {
            SinkConfiguration::File(_) => "file",
            SinkConfiguration::DatabaseCallback(_) => "database_callback",
            SinkConfiguration::MetricsPush(_) => "metrics_push",
            SinkConfiguration::Unimplemented { kind } => kind,
        }
    }

    /// Whether run metrics should be pushed after the run
    pub fn push_run_metrics(&self) -> bool {
        matches!(
            self,
            SinkConfiguration::MetricsPush(MetricsPushDestination {
                push_run_metrics: true,
                ..
            })
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            SinkConfiguration::File(file) if file.directory.as_os_str().is_empty() => Err(
                ConfigError::Invalid("file destination needs a directory".to_string()),
            ),
            SinkConfiguration::DatabaseCallback(cb) if cb.connection_string.trim().is_empty() => {
                Err(ConfigError::Invalid(
                    "database_callback destination needs a connection_string".to_string(),
                ))
            }
            SinkConfiguration::DatabaseCallback(cb) if cb.routine.trim().is_empty() => Err(
                ConfigError::Invalid("database_callback destination needs a routine".to_string()),
            ),
            SinkConfiguration::MetricsPush(push)
                if !(push.url.starts_with("http://") || push.url.starts_with("https://")) =>
            {
                Err(ConfigError::Invalid(format!(
                    "metrics_push url must be http(s), got '{}'",
                    push.url
                )))
            }
            SinkConfiguration::MetricsPush(push)
                if push.name_column.trim().is_empty() || push.value_column.trim().is_empty() =>
            {
                Err(ConfigError::Invalid(
                    "metrics_push column names must not be empty".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL: &str = r#"
max_parallelism = 4
connect_timeout_secs = 5

[logging]
level = "debug"
format = "compact"

[[instances]]
ci = "CI00001"
host = "db01.example.com"
port = 14330
user = "monitor"
password = "pw"
[instances.extra_labels]
env = "prod"
dc = "MSK"
tier = 2

[[instances]]
ci = "CI00002"
host = "db02"
instance_name = "SQLEXPRESS"
user = "monitor"

[[queries]]
request_id = "cpu"
query_text = "SELECT 'cpu' AS metric_name, 1 AS metric_value"

[[queries]]
request_id = "mem"
query_text = "SELECT 2"

[destination]
type = "metrics_push"
url = "http://vm:8428/api/v1/import/prometheus"
push_run_metrics = true
"#;

    #[test]
    fn test_config_default() {
        let config = CollectorConfig::default();
        assert_eq!(config.max_parallelism, 8);
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert!(config.instances.is_empty());
        assert_eq!(config.destination.kind(), "file");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = CollectorConfig::from_toml_str(FULL, "inline").unwrap();
        config.validate().unwrap();

        assert_eq!(config.max_parallelism, 4);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.queries.len(), 2);
        assert_eq!(config.queries[0].request_id, "cpu");
        assert!(config.destination.push_run_metrics());

        let instances = config.instance_descriptors();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].address.to_string(), "db01.example.com,14330");
        assert_eq!(
            instances[0].extra_labels,
            vec![
                ("env".to_string(), "prod".to_string()),
                ("dc".to_string(), "MSK".to_string()),
                ("tier".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(instances[1].address.to_string(), "db02\\SQLEXPRESS");
        assert!(instances[1].credentials.needs_password());
    }

    #[test]
    fn test_instances_without_ci_or_host_are_skipped() {
        let config = CollectorConfig::from_toml_str(
            r#"
[[instances]]
ci = ""
host = "db01"

[[instances]]
ci = "CI2"

[[instances]]
ci = "CI3"
host = "db03"
"#,
            "inline",
        )
        .unwrap();

        let instances = config.instance_descriptors();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].ci, "CI3");
    }

    #[test]
    fn test_destination_variants() {
        let parse = |s: &str| CollectorConfig::from_toml_str(s, "inline").map(|c| c.destination);

        assert_eq!(
            parse("[destination]\ntype = \"file\"\ndirectory = \"/var/out\"").unwrap(),
            SinkConfiguration::File(FileDestination {
                directory: PathBuf::from("/var/out")
            })
        );
        assert_eq!(
            parse("[destination]\ntype = \"database_callback\"\nconnection_string = \"server=x\"\nroutine = \"dbo.save\"").unwrap(),
            SinkConfiguration::DatabaseCallback(CallbackDestination {
                connection_string: "server=x".into(),
                routine: "dbo.save".into(),
            })
        );

        let push = parse("[destination]\ntype = \"Prometheus\"\nurl = \"http://x\"").unwrap();
        match push {
            SinkConfiguration::MetricsPush(p) => {
                assert_eq!(p.name_column, "metric_name");
                assert_eq!(p.value_column, "metric_value");
                assert!(!p.push_run_metrics);
            }
            other => panic!("unexpected destination {:?}", other),
        }

        assert_eq!(
            parse("[destination]\ntype = \"kafka\"").unwrap(),
            SinkConfiguration::Unimplemented {
                kind: "kafka".into()
            }
        );
        assert!(parse("[destination]\ntype = 3").is_err());
    }

    #[test]
    fn test_validation_errors() {
        let invalid = |s: &str| {
            let config = CollectorConfig::from_toml_str(s, "inline").unwrap();
            matches!(config.validate(), Err(ConfigError::Invalid(_)))
        };

        assert!(invalid("max_parallelism = 0"));
        assert!(invalid("connect_timeout_secs = 0"));
        assert!(invalid("[[queries]]\nrequest_id = \" \"\nquery_text = \"SELECT 1\""));
        assert!(invalid("[[queries]]\nrequest_id = \"q\"\nquery_text = \"\""));
        assert!(invalid("[destination]\ntype = \"database_callback\"\nroutine = \"dbo.x\""));
        assert!(invalid("[destination]\ntype = \"database_callback\"\nconnection_string = \"server=x\""));
        assert!(invalid("[destination]\ntype = \"metrics_push\"\nurl = \"vm:8428\""));
    }

    #[test]
    fn test_debug_hides_password() {
        let config = CollectorConfig::from_toml_str(FULL, "inline").unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("CI00001"));
        assert!(!debug.contains("\"pw\""));
    }

    #[test]
    fn test_resolve_path_order() {
        assert_eq!(
            CollectorConfig::resolve_path(Some("a.toml".into()), Some("b.toml".into())),
            PathBuf::from("a.toml")
        );
        assert_eq!(
            CollectorConfig::resolve_path(None, Some("b.toml".into())),
            PathBuf::from("b.toml")
        );
        assert_eq!(
            CollectorConfig::resolve_path(Some(" ".into()), None),
            PathBuf::from(DEFAULT_CONFIG_FILE)
        );
    }

    #[test]
    fn test_load_merges_side_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("collector.toml"),
            r#"
instances_file = "fleet.toml"
queries_file = "queries.toml"

[[queries]]
request_id = "inline"
query_text = "SELECT 1"
"#,
        )
        .unwrap();
        std::fs::write(
            temp_dir.path().join("fleet.toml"),
            "[[instances]]\nci = \"CI9\"\nhost = \"db09\"\n",
        )
        .unwrap();
        std::fs::write(
            temp_dir.path().join("queries.toml"),
            "[[queries]]\nrequest_id = \"side\"\nquery_text = \"SELECT 2\"\n",
        )
        .unwrap();

        let config = CollectorConfig::load(&temp_dir.path().join("collector.toml")).unwrap();
        assert_eq!(config.instances.len(), 1);
        let ids: Vec<_> = config.queries.iter().map(|q| q.request_id.as_str()).collect();
        assert_eq!(ids, vec!["inline", "side"]);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = CollectorConfig::load(&temp_dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_malformed_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "max_parallelism = \"many\"").unwrap();
        let err = CollectorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
