//! Process configuration: one `clap::Parser` struct with an `env` attribute
//! on every field, so every knob in spec.md §6.2 can be set by flag or by
//! environment variable with the documented default.

use clap::Parser;
use std::time::Duration;

/// Snapshot & Restore Orchestration Core.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Postgres connection string for the job store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Maximum job store pool connections.
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value = "10")]
    pub database_max_connections: u32,

    /// Keystone identity endpoint base URL.
    #[arg(long, env = "OS_IDENTITY_ENDPOINT")]
    pub identity_endpoint: String,

    /// Nova compute endpoint base URL.
    #[arg(long, env = "OS_COMPUTE_ENDPOINT")]
    pub compute_endpoint: String,

    /// Cinder volume endpoint base URL.
    #[arg(long, env = "OS_VOLUME_ENDPOINT")]
    pub volume_endpoint: String,

    /// Neutron network endpoint base URL.
    #[arg(long, env = "OS_NETWORK_ENDPOINT")]
    pub network_endpoint: String,

    /// Master flag for the restore surface; when false, every restore
    /// endpoint refuses with `ForbiddenError`.
    #[arg(long, env = "RESTORE_ENABLED", default_value = "true")]
    pub restore_enabled: bool,

    /// Planner still writes plans; the executor skips cloud mutations and
    /// synthesizes `dryrun-<uuid>` ids instead.
    #[arg(long, env = "RESTORE_DRY_RUN")]
    pub restore_dry_run: bool,

    /// On rollback, delete created volumes instead of leaving them for
    /// inspection.
    #[arg(long, env = "RESTORE_CLEANUP_VOLUMES")]
    pub restore_cleanup_volumes: bool,

    /// How often the snapshot worker re-runs policy assignment (Stage A).
    #[arg(long, env = "POLICY_ASSIGN_INTERVAL_MINUTES", default_value = "60")]
    pub policy_assign_interval_minutes: u64,

    /// How often the snapshot worker runs the snapshot+retention pass
    /// (Stages C and D).
    #[arg(long, env = "AUTO_SNAPSHOT_INTERVAL_MINUTES", default_value = "60")]
    pub auto_snapshot_interval_minutes: u64,

    /// Volumes larger than this are always skipped with `reason=oversized`.
    #[arg(long, env = "AUTO_SNAPSHOT_MAX_SIZE_GB", default_value = "260")]
    pub auto_snapshot_max_size_gb: u32,

    /// As `RESTORE_DRY_RUN` but for snapshot-worker mutations.
    #[arg(long, env = "AUTO_SNAPSHOT_DRY_RUN")]
    pub auto_snapshot_dry_run: bool,

    /// Rule document path read by the policy engine (§6.3).
    #[arg(long, env = "POLICY_RULES_PATH", default_value = "policy-rules.json")]
    pub policy_rules_path: String,

    /// Service account identity used to mint per-project sessions.
    #[arg(long, env = "SNAPSHOT_SERVICE_USER_EMAIL")]
    pub snapshot_service_user_email: Option<String>,

    /// Plain password; mutually exclusive with the encrypted pair.
    #[arg(long, env = "SNAPSHOT_SERVICE_USER_PASSWORD")]
    pub snapshot_service_user_password: Option<String>,

    /// Decryption key for `SNAPSHOT_USER_PASSWORD_ENCRYPTED`.
    #[arg(long, env = "SNAPSHOT_PASSWORD_KEY")]
    pub snapshot_password_key: Option<String>,

    /// Encrypted service-account password, paired with `SNAPSHOT_PASSWORD_KEY`.
    #[arg(long, env = "SNAPSHOT_USER_PASSWORD_ENCRYPTED")]
    pub snapshot_user_password_encrypted: Option<String>,

    /// Force every session request to fall back to the admin session.
    #[arg(long, env = "SNAPSHOT_SERVICE_USER_DISABLED")]
    pub snapshot_service_user_disabled: bool,

    /// HTTP surface bind address (§6.1).
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8088")]
    pub http_addr: String,

    /// Health server bind address.
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    pub health_addr: String,

    /// Metrics server bind address.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn policy_assign_interval(&self) -> Duration {
        Duration::from_secs(self.policy_assign_interval_minutes * 60)
    }

    pub fn auto_snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.auto_snapshot_interval_minutes * 60)
    }

    pub fn cloud_endpoints(&self) -> crate::cloud::Endpoints {
        crate::cloud::Endpoints {
            identity: self.identity_endpoint.clone(),
            compute: self.compute_endpoint.clone(),
            volume: self.volume_endpoint.clone(),
            network: self.network_endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn config_command_is_well_formed() {
        Config::command().debug_assert();
    }

    #[test]
    fn interval_helpers_convert_minutes_to_duration() {
        let cfg = Config::parse_from([
            "orchestration-core",
            "--database-url",
            "postgres://localhost/test",
            "--os-identity-endpoint",
            "http://identity",
            "--os-compute-endpoint",
            "http://compute",
            "--os-volume-endpoint",
            "http://volume",
            "--os-network-endpoint",
            "http://network",
        ]);
        assert_eq!(cfg.policy_assign_interval(), Duration::from_secs(3600));
        assert_eq!(cfg.auto_snapshot_max_size_gb, 260);
    }
}
