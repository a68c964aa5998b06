//! # Replicore Configuration
//!
//! Typed configuration for the controller, the workers and the admin CLI.
//! Settings are loaded from a TOML file plus `REPLICORE_*` environment
//! overrides, deserialized into the section structs below and validated once
//! at startup. A missing or malformed setting aborts the process; no section
//! has silent fallbacks for its required keys.
//!
//! Key names follow the dotted form used across the deployment tooling,
//! e.g. `common.request-buf-size-bytes` or `worker.async-loader-auto-resume`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{ReplicaError, ReplicaResult};

/// Valid database, table and worker names
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

/// Valid filesystem paths for export/data folders
static PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_/.-]+$").expect("valid regex"));

/// Check a database/table/worker name against the `[A-Za-z0-9_]` contract
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Check a filesystem path against the name contract extended with `/`
pub fn is_valid_path(path: &str) -> bool {
    PATH_RE.is_match(path)
}

/// Settings shared by the controller and the workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommonConfig {
    /// Identity of this deployment; carried in every request header and
    /// checked by workers (mismatch is a protocol violation)
    pub instance_id: String,
    /// Size of the reusable wire message buffer
    pub request_buf_size_bytes: usize,
    /// Base interval of the request tracking/retry timer, and the cap of the
    /// messenger's reconnect back-off
    pub request_retry_interval_sec: u64,
}

/// Controller-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControllerConfig {
    /// Default expiration interval of a request (0 disables the deadline)
    pub request_timeout_sec: u64,
    /// Default expiration interval of a job (0 disables the deadline)
    pub job_timeout_sec: u64,
    /// Interval between job heartbeat persists (0 disables heartbeats)
    pub job_heartbeat_timeout_sec: u64,
    /// Bind port of the REST ingress
    pub http_port: u16,
    /// Shared key required by the REST ingress for state-changing calls
    pub auth_key: String,
}

/// Worker-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    /// Size of the request processing pool of each worker
    pub num_svc_processing_threads: usize,
    /// Size of the asynchronous ingest loading pool of each worker
    pub num_async_loader_processing_threads: usize,
    /// Non-zero: remove temporary files of interrupted contributions before
    /// reclassifying them at startup
    pub async_loader_cleanup_on_resume: u32,
    /// Non-zero: re-submit contributions interrupted before the read stage
    /// completed, instead of failing them
    pub async_loader_auto_resume: u32,
    /// Default number of automatic retries for failed contributions
    pub ingest_num_retries: u32,
    /// Hard cap on the per-contribution retry limit requested by clients
    pub ingest_max_retries: u32,
    /// Default character set of ingested CSV payloads
    pub ingest_charset_name: String,
    /// Cap on the number of per-row warnings retained by a contribution
    pub ingest_max_warnings: u64,
}

impl WorkerConfig {
    /// Whether interrupted-contribution temporary files are removed on boot
    pub fn cleanup_on_resume(&self) -> bool {
        self.async_loader_cleanup_on_resume != 0
    }

    /// Whether eligible interrupted contributions are re-submitted on boot
    pub fn auto_resume(&self) -> bool {
        self.async_loader_auto_resume != 0
    }
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseStoreConfig {
    /// Number of database-service handles in the controller-side pool
    pub services_pool_size: usize,
    /// Scratch folder for director-index consolidation on the master
    pub qserv_master_tmp_dir: PathBuf,
    /// Connection URL of the persistent backend; when absent the transient
    /// in-memory backend is used (tests, ephemeral deployments)
    #[serde(default)]
    pub url: Option<String>,
}

/// A storage worker's stable identity and physical endpoints.
///
/// Created at configuration load, immutable for the process lifetime, and
/// referenced by every request targeting the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerIdentity {
    pub name: String,
    pub host: String,
    /// Replication wire protocol port
    pub port: u16,
    /// Management/ingest HTTP port
    pub http_port: u16,
    /// Bulk file delivery port
    pub loader_port: u16,
    /// Root of the worker's MySQL data folder
    pub data_dir: PathBuf,
}

/// A database family: tables partitioned together with identical chunk
/// geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FamilyConfig {
    pub name: String,
    /// Required number of complete replicas per chunk
    pub min_replication_level: usize,
}

/// Static description of one database and its tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseInfo {
    pub name: String,
    pub family: String,
    /// The partition anchor; shares its chunk decomposition with every other
    /// partitioned table of the family
    pub director_table: String,
    /// Partitioned tables, the director included
    pub partitioned_tables: Vec<String>,
    #[serde(default)]
    pub regular_tables: Vec<String>,
    /// Published databases no longer accept ingest contributions
    #[serde(default)]
    pub is_published: bool,
}

/// Root configuration object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplicoreConfig {
    pub common: CommonConfig,
    pub controller: ControllerConfig,
    pub worker: WorkerConfig,
    pub database: DatabaseStoreConfig,
    #[serde(default)]
    pub workers: Vec<WorkerIdentity>,
    #[serde(default)]
    pub families: Vec<FamilyConfig>,
    #[serde(default)]
    pub databases: Vec<DatabaseInfo>,
}

impl ReplicoreConfig {
    /// Load and validate the configuration from a TOML file plus
    /// `REPLICORE_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> ReplicaResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("REPLICORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ReplicaError::config(format!("failed to read configuration: {e}")))?;
        let cfg: ReplicoreConfig = settings
            .try_deserialize()
            .map_err(|e| ReplicaError::config(format!("malformed configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field invariants. Called by [`Self::load`]; also
    /// available to tests constructing configurations in code.
    pub fn validate(&self) -> ReplicaResult<()> {
        if self.common.instance_id.is_empty() {
            return Err(ReplicaError::config("common.instance-id must not be empty"));
        }
        if self.common.request_buf_size_bytes == 0 {
            return Err(ReplicaError::config(
                "common.request-buf-size-bytes must be positive",
            ));
        }
        if self.common.request_retry_interval_sec == 0 {
            return Err(ReplicaError::config(
                "common.request-retry-interval-sec must be positive",
            ));
        }
        if self.worker.num_svc_processing_threads == 0 {
            return Err(ReplicaError::config(
                "worker.num-svc-processing-threads must be positive",
            ));
        }
        if self.worker.num_async_loader_processing_threads == 0 {
            return Err(ReplicaError::config(
                "worker.num-async-loader-processing-threads must be positive",
            ));
        }
        if self.worker.ingest_max_retries < self.worker.ingest_num_retries {
            return Err(ReplicaError::config(
                "worker.ingest-max-retries must not be below worker.ingest-num-retries",
            ));
        }
        if self.database.services_pool_size == 0 {
            return Err(ReplicaError::config(
                "database.services_pool_size must be positive",
            ));
        }

        let mut worker_names = HashSet::new();
        for worker in &self.workers {
            if !is_valid_name(&worker.name) {
                return Err(ReplicaError::config(format!(
                    "invalid worker name: '{}'",
                    worker.name
                )));
            }
            if !worker_names.insert(worker.name.as_str()) {
                return Err(ReplicaError::config(format!(
                    "duplicate worker name: '{}'",
                    worker.name
                )));
            }
        }

        let family_names: HashSet<&str> = self.families.iter().map(|f| f.name.as_str()).collect();
        for database in &self.databases {
            if !is_valid_name(&database.name) {
                return Err(ReplicaError::config(format!(
                    "invalid database name: '{}'",
                    database.name
                )));
            }
            if !family_names.contains(database.family.as_str()) {
                return Err(ReplicaError::config(format!(
                    "database '{}' references unknown family '{}'",
                    database.name, database.family
                )));
            }
            if !database
                .partitioned_tables
                .contains(&database.director_table)
            {
                return Err(ReplicaError::config(format!(
                    "director table '{}' of database '{}' is not among its partitioned tables",
                    database.director_table, database.name
                )));
            }
            for table in database
                .partitioned_tables
                .iter()
                .chain(database.regular_tables.iter())
            {
                if !is_valid_name(table) {
                    return Err(ReplicaError::config(format!(
                        "invalid table name '{}' in database '{}'",
                        table, database.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a worker's identity by name
    pub fn worker(&self, name: &str) -> ReplicaResult<&WorkerIdentity> {
        self.workers
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| ReplicaError::not_found(format!("unknown worker '{name}'")))
    }

    /// Assert a worker name is known to the configuration
    pub fn assert_worker_is_valid(&self, name: &str) -> ReplicaResult<()> {
        self.worker(name).map(|_| ())
    }

    /// Look up a database description by name
    pub fn database(&self, name: &str) -> ReplicaResult<&DatabaseInfo> {
        self.databases
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ReplicaError::not_found(format!("unknown database '{name}'")))
    }

    /// Look up a family by name
    pub fn family(&self, name: &str) -> ReplicaResult<&FamilyConfig> {
        self.families
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| ReplicaError::not_found(format!("unknown family '{name}'")))
    }

    /// All databases of a family
    pub fn family_databases(&self, family: &str) -> Vec<&DatabaseInfo> {
        self.databases
            .iter()
            .filter(|d| d.family == family)
            .collect()
    }

    /// All known worker names
    pub fn worker_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> String {
        r#"
            [common]
            instance-id = "qdev"
            request-buf-size-bytes = 1048576
            request-retry-interval-sec = 60

            [controller]
            request-timeout-sec = 600
            job-timeout-sec = 3600
            job-heartbeat-timeout-sec = 60
            http-port = 25081
            auth-key = "changeme"

            [worker]
            num-svc-processing-threads = 4
            num-async-loader-processing-threads = 2
            async-loader-cleanup-on-resume = 1
            async-loader-auto-resume = 0
            ingest-num-retries = 1
            ingest-max-retries = 10
            ingest-charset-name = "latin1"
            ingest-max-warnings = 64

            [database]
            services-pool-size = 2
            qserv-master-tmp-dir = "/tmp/replicore"

            [[workers]]
            name = "W1"
            host = "127.0.0.1"
            port = 25000
            http-port = 25004
            loader-port = 25002
            data-dir = "/var/lib/replicore/W1"

            [[families]]
            name = "production"
            min-replication-level = 2

            [[databases]]
            name = "D"
            family = "production"
            director-table = "Obj"
            partitioned-tables = ["Obj", "Src"]
            regular-tables = ["Filter"]
        "#
        .to_string()
    }

    fn load_from_str(body: &str) -> ReplicaResult<ReplicoreConfig> {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").expect("temp file");
        file.write_all(body.as_bytes()).expect("write config");
        ReplicoreConfig::load(file.path())
    }

    #[test]
    fn test_load_valid_config() {
        let cfg = load_from_str(&sample_toml()).expect("config should load");
        assert_eq!(cfg.common.instance_id, "qdev");
        assert_eq!(cfg.common.request_buf_size_bytes, 1048576);
        assert!(cfg.worker.cleanup_on_resume());
        assert!(!cfg.worker.auto_resume());
        assert_eq!(cfg.database.services_pool_size, 2);
        assert_eq!(cfg.worker("W1").unwrap().port, 25000);
        assert_eq!(cfg.family_databases("production").len(), 1);
    }

    #[test]
    fn test_missing_section_fails() {
        let body = sample_toml().replace("[controller]", "[controller-disabled]");
        assert!(load_from_str(&body).is_err());
    }

    #[test]
    fn test_zero_pool_size_fails() {
        let body = sample_toml().replace("services-pool-size = 2", "services-pool-size = 0");
        let err = load_from_str(&body).unwrap_err();
        assert!(format!("{err}").contains("services_pool_size"));
    }

    #[test]
    fn test_unknown_family_fails() {
        let body = sample_toml().replace("family = \"production\"", "family = \"absent\"");
        assert!(load_from_str(&body).is_err());
    }

    #[test]
    fn test_director_must_be_partitioned() {
        let body = sample_toml().replace(
            "partitioned-tables = [\"Obj\", \"Src\"]",
            "partitioned-tables = [\"Src\"]",
        );
        assert!(load_from_str(&body).is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("Object_2024"));
        assert!(!is_valid_name("bad-name"));
        assert!(!is_valid_name(""));
        assert!(is_valid_path("/qserv/data/export"));
        assert!(!is_valid_path("/qserv/data;rm"));
    }

    #[test]
    fn test_unknown_worker_lookup() {
        let cfg = load_from_str(&sample_toml()).expect("config should load");
        assert!(cfg.worker("W9").is_err());
        assert!(cfg.assert_worker_is_valid("W1").is_ok());
    }
}
