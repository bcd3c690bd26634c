use anyhow::{Context as _, Result};
use control::apis::metrics::serve_metrics;
use control::client::{ClusterClient, KubeClusterClient};
use control::config::ControllerConfig;
use control::controller::{self, Context};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Kubernetes TLS client needs a process-wide crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControllerConfig::from_env().context("invalid configuration")?;
    info!("Gateway controller {} starting", config.controller_name);
    info!("   Secrets namespace: {}", config.secrets_namespace);
    info!("   Enforce HTTPS: {}", config.enforce_https);

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(kube_client.clone()));

    let metrics_addr = config.metrics_addr.clone();
    let metrics = tokio::spawn(async move {
        if let Some(addr) = metrics_addr {
            if let Err(e) = serve_metrics(&addr).await {
                error!("Metrics endpoint on {} failed: {}", addr, e);
            }
        }
    });

    let ctx = Arc::new(Context::new(cluster, config));

    tokio::select! {
        _ = controller::run(kube_client, ctx) => {
            info!("Controllers stopped");
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    metrics.abort();
    Ok(())
}
