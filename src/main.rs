use anyhow::Context;
use clap::Parser;
use kube::Client;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

mod cli;

use audit_scanner::cancellation::CancellationToken;
use audit_scanner::evaluator::PolicyEvaluator;
use audit_scanner::k8s::K8sClient;
use audit_scanner::policies::PolicyCatalog;
use audit_scanner::scanner::Scanner;
use audit_scanner::store::{PolicyReportStore, ReportStore, Store, SuseObsStore};
use cli::Cli;

/// Cancel the scan on Ctrl+C instead of tearing the process down.
///
/// The engine checks the token before starting new work and races in-flight
/// requests against it, so an interrupted run drains quickly, skips the
/// reap, still sends the scan-end notification, and exits non-zero with a
/// "scan canceled" error.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted. Finishing in-flight work...");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(false),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.loglevel)),
        )
        .init();

    let client = Client::try_default()
        .await
        .context("failed to load kubeconfig")?;

    let k8s = K8sClient::new(
        client.clone(),
        &cli.kubewarden_namespace,
        &cli.ignore_namespaces,
        cli.page_size,
    );
    let catalog = PolicyCatalog::load(client.clone(), &k8s, cli.policy_server_url.as_deref())
        .await
        .context("failed to load the policy catalog")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let tls = cli.tls_options();
    let evaluator = PolicyEvaluator::new(&tls, cli.parallel_policies, cancel.clone())
        .context("failed to set up the policy server client")?;

    let store = match cli.suseobs_settings()? {
        Some(settings) => Store::SuseObs(
            SuseObsStore::new(settings, &tls)
                .context("failed to set up the SUSE Observability store")?,
        ),
        None if cli.disable_store => Store::Disabled,
        None => Store::Cluster(PolicyReportStore::new(client)),
    };

    let scanner = Scanner::new(
        k8s,
        catalog,
        evaluator,
        store,
        cli.parallel_namespaces,
        cli.parallel_resources,
        cli.output_scan,
        cancel,
    );

    let run_uid = Uuid::new_v4().to_string();
    run(&scanner, cli.namespace.as_deref(), cli.cluster, &run_uid).await
}

async fn run<S: ReportStore>(
    scanner: &Scanner<S>,
    namespace: Option<&str>,
    cluster_wide: bool,
    run_uid: &str,
) -> anyhow::Result<()> {
    if cluster_wide {
        return scanner.scan_cluster_wide_resources(run_uid).await;
    }
    if let Some(namespace) = namespace {
        return scanner.scan_namespace(namespace, run_uid).await;
    }

    // Neither flag given: audit cluster-wide resources, then every namespace.
    scanner.scan_cluster_wide_resources(run_uid).await?;
    scanner.scan_all_namespaces(run_uid).await
}
