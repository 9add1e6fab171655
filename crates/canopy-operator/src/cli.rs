//! Command line interface
//!
//! Every flag has an environment fallback so the same image can be
//! configured from a Deployment spec.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use canopy_authz::initializing::DEFAULT_INITIALIZING_PATH;
use canopy_authz::scope::DEFAULT_ROOT_PATH;
use canopy_authz::AllScopePolicy;
use canopy_common::client::ClusterRouting;
use canopy_common::telemetry::LogFormat;
use canopy_scheduler::RateLimiterConfig;
use clap::{Args, Parser, Subcommand};

/// Canopy - multi-tenant workspace control plane
#[derive(Parser, Debug)]
#[command(name = "canopy", version, about, long_about = None)]
pub struct Cli {
    /// Stdout log format (json or pretty)
    #[arg(long, env = "CANOPY_LOG_FORMAT", default_value = "json", global = true)]
    pub log_format: LogFormat,

    /// How logical clusters are addressed (single or path-prefix)
    #[arg(long, env = "CANOPY_CLUSTER_ROUTING", default_value = "single", global = true)]
    pub cluster_routing: ClusterRouting,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the CRD manifests and exit
    Crd,
    /// Place tenant namespaces onto WorkloadClusters
    Scheduler(SchedulerArgs),
    /// Serve the Workspace admission webhook
    Webhook(WebhookArgs),
    /// Serve the workspaces, initializing-workspaces and content views
    VirtualWorkspaces(VirtualWorkspacesArgs),
}

#[derive(Args, Debug)]
pub struct SchedulerArgs {
    /// Workers per queue
    #[arg(long, env = "CANOPY_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Ceiling of the per-key retry backoff, in seconds
    #[arg(long, env = "CANOPY_MAX_BACKOFF_SECS", default_value_t = 1000)]
    pub max_backoff_secs: u64,

    /// Install the CRDs with server-side apply before starting
    #[arg(long, env = "CANOPY_INSTALL_CRDS")]
    pub install_crds: bool,
}

impl SchedulerArgs {
    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_delay: Duration::from_secs(self.max_backoff_secs),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct TlsArgs {
    /// PEM certificate served to clients
    #[arg(long, env = "CANOPY_TLS_CERT_FILE")]
    pub tls_cert_file: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, env = "CANOPY_TLS_KEY_FILE")]
    pub tls_key_file: PathBuf,
}

impl TlsArgs {
    /// Read both PEM files
    pub fn read(&self) -> std::io::Result<(String, String)> {
        Ok((
            std::fs::read_to_string(&self.tls_cert_file)?,
            std::fs::read_to_string(&self.tls_key_file)?,
        ))
    }
}

#[derive(Args, Debug)]
pub struct WebhookArgs {
    /// Listen address
    #[arg(long, env = "CANOPY_WEBHOOK_BIND", default_value = "0.0.0.0:9443")]
    pub bind: SocketAddr,

    #[command(flatten)]
    pub tls: TlsArgs,
}

#[derive(Args, Debug)]
pub struct VirtualWorkspacesArgs {
    /// Listen address
    #[arg(long, env = "CANOPY_VIRTUAL_WORKSPACES_BIND", default_value = "0.0.0.0:6443")]
    pub bind: SocketAddr,

    /// Path prefix of the workspaces view
    #[arg(long, env = "CANOPY_ROOT_PATH", default_value = DEFAULT_ROOT_PATH)]
    pub root_path: String,

    /// Path prefix of the initializing-workspaces view
    #[arg(long, env = "CANOPY_INITIALIZING_PATH", default_value = DEFAULT_INITIALIZING_PATH)]
    pub initializing_path: String,

    /// Membership rule of the `all` scope (org-membership or per-workspace)
    #[arg(long, env = "CANOPY_ALL_SCOPE_POLICY", default_value = "org-membership")]
    pub all_scope_policy: AllScopePolicy,

    /// Connect timeout for content forwarding, in seconds
    #[arg(long, env = "CANOPY_FORWARD_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub forward_connect_timeout_secs: u64,

    #[command(flatten)]
    pub tls: TlsArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults() {
        let cli = Cli::try_parse_from(["canopy", "scheduler"]).unwrap();
        assert_eq!(cli.cluster_routing, ClusterRouting::Single);
        let Commands::Scheduler(args) = cli.command else {
            panic!("expected scheduler");
        };
        assert_eq!(args.workers, 2);
        assert_eq!(args.rate_limiter().max_delay, Duration::from_secs(1000));
        assert_eq!(args.rate_limiter().burst, 100);
    }

    #[test]
    fn virtual_workspaces_flags() {
        let cli = Cli::try_parse_from([
            "canopy",
            "--cluster-routing",
            "path-prefix",
            "virtual-workspaces",
            "--all-scope-policy",
            "per-workspace",
            "--tls-cert-file",
            "/tls/tls.crt",
            "--tls-key-file",
            "/tls/tls.key",
        ])
        .unwrap();
        assert_eq!(cli.cluster_routing, ClusterRouting::PathPrefix);
        let Commands::VirtualWorkspaces(args) = cli.command else {
            panic!("expected virtual-workspaces");
        };
        assert_eq!(args.all_scope_policy, AllScopePolicy::PerWorkspaceAccess);
        assert_eq!(args.root_path, "/services/workspaces");
        assert_eq!(args.bind.port(), 6443);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let result = Cli::try_parse_from([
            "canopy",
            "virtual-workspaces",
            "--all-scope-policy",
            "everyone",
            "--tls-cert-file",
            "a",
            "--tls-key-file",
            "b",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn webhook_requires_tls() {
        assert!(Cli::try_parse_from(["canopy", "webhook"]).is_err());
    }
}
