use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;

use audit_scanner::evaluator::TlsOptions;
use audit_scanner::store::SuseObsSettings;

#[derive(Parser, Debug)]
#[command(name = "audit-scanner")]
#[command(
    about = "Reports evaluation of existing Kubernetes resources with your already deployed Kubewarden policies"
)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Namespace to be evaluated
    #[arg(short, long, conflicts_with = "cluster")]
    pub namespace: Option<String>,

    /// Scan cluster-wide resources
    #[arg(short, long)]
    pub cluster: bool,

    /// Namespace where the Kubewarden components (e.g. PolicyServer) are installed
    #[arg(short, long, default_value = "kubewarden")]
    pub kubewarden_namespace: String,

    /// URL to the PolicyServers the scanner will query, bypassing the
    /// in-cluster Service lookup. Example: https://localhost:3000
    #[arg(short = 'u', long)]
    pub policy_server_url: Option<String>,

    /// Level of the logs
    #[arg(short, long, default_value = "info")]
    pub loglevel: String,

    /// Print result of the scan in JSON to stdout
    #[arg(short, long)]
    pub output_scan: bool,

    /// Comma separated list of namespace names to be skipped from scan.
    /// This flag can be repeated
    #[arg(short, long = "ignore-namespaces", value_delimiter = ',')]
    pub ignore_namespaces: Vec<String>,

    /// Skip SSL cert validation when connecting to PolicyServers endpoints.
    /// Useful for development
    #[arg(long)]
    pub insecure_ssl: bool,

    /// File path to CA cert in PEM format of PolicyServer endpoints
    #[arg(short = 'f', long)]
    pub extra_ca: Option<PathBuf>,

    /// File path to client cert in PEM format used for mTLS communication
    /// with the PolicyServer endpoints
    #[arg(long, requires = "client_key")]
    pub client_cert: Option<PathBuf>,

    /// File path to client key in PEM format used for mTLS communication
    /// with the PolicyServer endpoints
    #[arg(long, requires = "client_cert")]
    pub client_key: Option<PathBuf>,

    /// Disable storing the results in the k8s cluster
    #[arg(long)]
    pub disable_store: bool,

    /// Number of namespaces to scan in parallel
    #[arg(long, default_value_t = 1)]
    pub parallel_namespaces: usize,

    /// Number of resources to scan in parallel
    #[arg(long, default_value_t = 100)]
    pub parallel_resources: usize,

    /// Number of policies to evaluate for a given resource in parallel
    #[arg(long, default_value_t = 5)]
    pub parallel_policies: usize,

    /// Number of resources to fetch from the Kubernetes API server when paginating
    #[arg(long, default_value_t = 100)]
    pub page_size: u32,

    /// Base URL of the SUSE Observability instance to push results to
    #[arg(long)]
    pub suseobs_url: Option<String>,

    /// API key of the SUSE Observability intake endpoint
    #[arg(long)]
    pub suseobs_apikey: Option<String>,

    /// URN of the SUSE Observability health stream
    #[arg(long)]
    pub suseobs_urn: Option<String>,

    /// Cluster name used as the health sub-stream id
    #[arg(long)]
    pub suseobs_cluster: Option<String>,

    /// Seconds between health snapshot repetitions
    #[arg(long, default_value_t = 1800)]
    pub suseobs_repeat_interval: u64,

    /// Seconds after which unrefreshed check states expire
    #[arg(long, default_value_t = 3600)]
    pub suseobs_expire_interval: u64,
}

impl Cli {
    pub fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            insecure: self.insecure_ssl,
            ca_file: self.extra_ca.clone(),
            client_cert: self.client_cert.clone(),
            client_key: self.client_key.clone(),
        }
    }

    /// The observability sink configuration, when fully provided.
    ///
    /// A partial set of `--suseobs-*` flags is a configuration error rather
    /// than a silent fallback to the CRD store.
    pub fn suseobs_settings(&self) -> Result<Option<SuseObsSettings>> {
        let any_set = self.suseobs_url.is_some()
            || self.suseobs_apikey.is_some()
            || self.suseobs_urn.is_some()
            || self.suseobs_cluster.is_some();
        if !any_set {
            return Ok(None);
        }

        match (
            &self.suseobs_url,
            &self.suseobs_apikey,
            &self.suseobs_urn,
            &self.suseobs_cluster,
        ) {
            (Some(url), Some(api_key), Some(urn), Some(cluster)) => Ok(Some(SuseObsSettings {
                url: url.clone(),
                api_key: api_key.clone(),
                urn: urn.clone(),
                cluster: cluster.clone(),
                repeat_interval: self.suseobs_repeat_interval,
                expire_interval: self.suseobs_expire_interval,
            })),
            _ => bail!(
                "--suseobs-url, --suseobs-apikey, --suseobs-urn and --suseobs-cluster must be provided together"
            ),
        }
    }
}

/* ============================= TESTS ============================= */
