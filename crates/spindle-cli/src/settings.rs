//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `SPINDLE_DATABASE_URL`: SQLite connection string (default: sqlite://spindle.db)
//! - `SPINDLE_HOST`: Name recorded in the engines table (default: $HOSTNAME or localhost)
//! - `SPINDLE_CPU`: Cores available to tasks (default: num_cpus)
//! - `SPINDLE_GPU`: GPUs available to tasks (default: 0)
//! - `SPINDLE_RAM_GIB`: Memory available to tasks in GiB (default: 64)
//! - `SPINDLE_SEAL_PATH`: Scratch storage root for sealing (optional)
//! - `SPINDLE_STORE_PATH`: Long-term storage root (optional)
//! - `SPINDLE_ENABLE_SDR` / `SPINDLE_SDR_MAX_TASKS`
//! - `SPINDLE_ENABLE_TREES` / `SPINDLE_TREES_MAX_TASKS`
//! - `SPINDLE_ENABLE_PRECOMMIT` / `SPINDLE_PRECOMMIT_MAX_TASKS`
//! - `SPINDLE_ENABLE_MOVE_STORAGE` / `SPINDLE_MOVE_STORAGE_MAX_TASKS`
//! - `SPINDLE_POLL_INTERVAL_MS`: Engine idle poll interval (default: 3000)
//! - `SPINDLE_PIPELINE_POLL_INTERVAL_MS`: Pipeline poller interval (default: 10000)
//! - `SPINDLE_HEARTBEAT_INTERVAL_MS`: Engine heartbeat interval (default: 10000)
//! - `SPINDLE_REAP_INTERVAL_MS`: Lease reaper interval (default: 30000)
//! - `SPINDLE_LEASE_TIMEOUT_MS`: Silence before an engine's tasks are returned (default: 60000)
//! - `SPINDLE_SIM_DELAY_MS`: Duration of each simulated seal call (default: 1000)
//!
//! A max of 0 means no per-type limit beyond the machine's resources.
//! Loop periods must be non-zero and the heartbeat shorter than the lease.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use spindle_core::app::{EngineConfig, PollerConfig, ReaperConfig};
use spindle_core::domain::Resources;
use spindle_core::sealing::LocalStorageInfo;

const GIB: u64 = 1 << 30;

/// Enabled task types and their concurrency caps.
#[derive(Debug, Clone, Default)]
pub struct Subsystems {
    pub sdr: Option<usize>,
    pub trees: Option<usize>,
    pub precommit: Option<usize>,
    pub move_storage: Option<usize>,
}

impl Subsystems {
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            ("SDR", self.sdr),
            ("SDRTrees", self.trees),
            ("PreCommitSend", self.precommit),
            ("MoveStorage", self.move_storage),
        ]
        .into_iter()
        .filter_map(|(name, max)| max.map(|_| name))
        .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub host: String,
    pub capacity: Resources,
    pub seal_path: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub subsystems: Subsystems,
    pub poll_interval: Duration,
    pub pipeline_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub reap_interval: Duration,
    pub lease_timeout: Duration,
    pub sim_delay: Duration,
}

impl Settings {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Same as [`Settings::from_env`] with variables looked up through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url =
            var("SPINDLE_DATABASE_URL").unwrap_or_else(|| "sqlite://spindle.db".to_string());
        let host = var("SPINDLE_HOST")
            .or_else(|| var("HOSTNAME"))
            .unwrap_or_else(|| "localhost".to_string());

        let cpu = parse_or(&var, "SPINDLE_CPU", num_cpus::get() as f64)?;
        let gpu = parse_or(&var, "SPINDLE_GPU", 0u32)?;
        let ram_gib = parse_or(&var, "SPINDLE_RAM_GIB", 64u64)?;

        let subsystems = Subsystems {
            sdr: subsystem(&var, "SDR")?,
            trees: subsystem(&var, "TREES")?,
            precommit: subsystem(&var, "PRECOMMIT")?,
            move_storage: subsystem(&var, "MOVE_STORAGE")?,
        };

        let settings = Self {
            database_url,
            host,
            capacity: Resources::new(cpu, gpu, ram_gib.saturating_mul(GIB)),
            seal_path: var("SPINDLE_SEAL_PATH").map(PathBuf::from),
            store_path: var("SPINDLE_STORE_PATH").map(PathBuf::from),
            subsystems,
            poll_interval: period_or(&var, "SPINDLE_POLL_INTERVAL_MS", 3_000)?,
            pipeline_poll_interval: period_or(&var, "SPINDLE_PIPELINE_POLL_INTERVAL_MS", 10_000)?,
            heartbeat_interval: period_or(&var, "SPINDLE_HEARTBEAT_INTERVAL_MS", 10_000)?,
            reap_interval: period_or(&var, "SPINDLE_REAP_INTERVAL_MS", 30_000)?,
            lease_timeout: period_or(&var, "SPINDLE_LEASE_TIMEOUT_MS", 60_000)?,
            sim_delay: parse_or(&var, "SPINDLE_SIM_DELAY_MS", 1_000u64).map(Duration::from_millis)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// An engine must heartbeat well within its lease or the reaper takes
    /// its running tasks.
    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval >= self.lease_timeout {
            bail!(
                "SPINDLE_HEARTBEAT_INTERVAL_MS ({}) must be below SPINDLE_LEASE_TIMEOUT_MS ({})",
                self.heartbeat_interval.as_millis(),
                self.lease_timeout.as_millis()
            );
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(self.capacity)
            .with_poll_interval(self.poll_interval)
            .with_heartbeat_interval(self.heartbeat_interval)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: self.pipeline_poll_interval,
            ..PollerConfig::default()
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reap_interval,
            lease_timeout: self.lease_timeout,
        }
    }

    /// Storage roots; one path for both roles makes a single root that can do both.
    pub fn storage_roots(&self) -> Vec<LocalStorageInfo> {
        match (&self.seal_path, &self.store_path) {
            (Some(seal), Some(store)) if seal == store => vec![LocalStorageInfo {
                id: "local".to_string(),
                root: seal.clone(),
                can_seal: true,
                can_store: true,
            }],
            (seal, store) => {
                let mut roots = Vec::new();
                if let Some(seal) = seal {
                    roots.push(LocalStorageInfo {
                        id: "seal".to_string(),
                        root: seal.clone(),
                        can_seal: true,
                        can_store: false,
                    });
                }
                if let Some(store) = store {
                    roots.push(LocalStorageInfo {
                        id: "store".to_string(),
                        root: store.clone(),
                        can_seal: false,
                        can_store: true,
                    });
                }
                roots
            }
        }
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        None => Ok(default),
    }
}

/// Loop periods; tokio intervals reject zero.
fn period_or(var: impl Fn(&str) -> Option<String>, name: &str, default_ms: u64) -> Result<Duration> {
    let ms = parse_or(var, name, default_ms)?;
    if ms == 0 {
        bail!("{name} must be greater than 0");
    }
    Ok(Duration::from_millis(ms))
}

fn flag(var: impl Fn(&str) -> Option<String>, name: &str) -> bool {
    var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// `Some(max)` when `SPINDLE_ENABLE_<NAME>` is set.
fn subsystem(var: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<usize>> {
    if !flag(&var, &format!("SPINDLE_ENABLE_{name}")) {
        return Ok(None);
    }
    parse_or(&var, &format!("SPINDLE_{name}_MAX_TASKS"), 0usize).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_any_variables() {
        let settings = load(&[]).unwrap();
        assert_eq!(settings.database_url, "sqlite://spindle.db");
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(settings.lease_timeout, Duration::from_secs(60));
        assert!(settings.subsystems.enabled().is_empty());
        assert!(settings.storage_roots().is_empty());
    }

    #[test]
    fn subsystems_follow_enable_flags() {
        let settings = load(&[
            ("SPINDLE_ENABLE_SDR", "true"),
            ("SPINDLE_SDR_MAX_TASKS", "2"),
            ("SPINDLE_ENABLE_TREES", " YES "),
            ("SPINDLE_ENABLE_PRECOMMIT", "0"),
            ("SPINDLE_ENABLE_MOVE_STORAGE", "1"),
        ])
        .unwrap();

        assert_eq!(settings.subsystems.sdr, Some(2));
        assert_eq!(settings.subsystems.trees, Some(0));
        assert_eq!(settings.subsystems.precommit, None);
        assert_eq!(
            settings.subsystems.enabled(),
            vec!["SDR", "SDRTrees", "MoveStorage"]
        );
    }

    #[test]
    fn max_tasks_is_only_read_for_enabled_types() {
        let settings = load(&[("SPINDLE_TREES_MAX_TASKS", "many")]).unwrap();
        assert_eq!(settings.subsystems.trees, None);

        let err = load(&[
            ("SPINDLE_ENABLE_TREES", "1"),
            ("SPINDLE_TREES_MAX_TASKS", "many"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("SPINDLE_TREES_MAX_TASKS"));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = load(&[("SPINDLE_GPU", "-1")]).unwrap_err();
        assert!(err.to_string().contains("SPINDLE_GPU"));

        let settings = load(&[("SPINDLE_CPU", " 12.5 "), ("SPINDLE_RAM_GIB", "8")]).unwrap();
        assert_eq!(settings.capacity, Resources::new(12.5, 0, 8 * GIB));
    }

    #[test]
    fn zero_loop_periods_are_rejected() {
        for name in [
            "SPINDLE_POLL_INTERVAL_MS",
            "SPINDLE_PIPELINE_POLL_INTERVAL_MS",
            "SPINDLE_HEARTBEAT_INTERVAL_MS",
            "SPINDLE_REAP_INTERVAL_MS",
            "SPINDLE_LEASE_TIMEOUT_MS",
        ] {
            let err = load(&[(name, "0")]).unwrap_err();
            assert!(err.to_string().contains(name), "{name}");
        }
        assert_eq!(
            load(&[("SPINDLE_SIM_DELAY_MS", "0")]).unwrap().sim_delay,
            Duration::ZERO
        );
    }

    #[test]
    fn heartbeat_must_be_shorter_than_the_lease() {
        let err = load(&[
            ("SPINDLE_HEARTBEAT_INTERVAL_MS", "60000"),
            ("SPINDLE_LEASE_TIMEOUT_MS", "60000"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("SPINDLE_LEASE_TIMEOUT_MS"));

        assert!(
            load(&[
                ("SPINDLE_HEARTBEAT_INTERVAL_MS", "1000"),
                ("SPINDLE_LEASE_TIMEOUT_MS", "5000"),
            ])
            .is_ok()
        );
    }

    #[test]
    fn one_path_for_both_roles_is_a_single_root() {
        let settings = load(&[
            ("SPINDLE_SEAL_PATH", "/data"),
            ("SPINDLE_STORE_PATH", "/data"),
        ])
        .unwrap();
        let roots = settings.storage_roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].root, PathBuf::from("/data"));
        assert!(roots[0].can_seal && roots[0].can_store);
    }

    #[test]
    fn separate_paths_split_the_roles() {
        let settings = load(&[
            ("SPINDLE_SEAL_PATH", "/scratch"),
            ("SPINDLE_STORE_PATH", "/archive"),
        ])
        .unwrap();
        let roots = settings.storage_roots();
        let roles: Vec<_> = roots
            .iter()
            .map(|r| (r.id.as_str(), r.can_seal, r.can_store))
            .collect();
        assert_eq!(roles, vec![("seal", true, false), ("store", false, true)]);

        let seal_only = load(&[("SPINDLE_SEAL_PATH", "/scratch")]).unwrap();
        assert!(seal_only.storage_roots().iter().all(|r| !r.can_store));
    }

    #[test]
    fn host_falls_back_to_hostname() {
        assert_eq!(load(&[("HOSTNAME", "sealer-3")]).unwrap().host, "sealer-3");
        assert_eq!(
            load(&[("HOSTNAME", "sealer-3"), ("SPINDLE_HOST", "box")])
                .unwrap()
                .host,
            "box"
        );
    }
}
