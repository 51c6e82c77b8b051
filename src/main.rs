//! FreeNAS iSCSI Provisioner
//!
//! Serves the provisioning REST API, a health endpoint and Prometheus metrics.
//! Storage classes come from the cluster unless a YAML file is given;
//! `--standalone` swaps the appliance for an in-memory one.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use freenas_iscsi_provisioner::domain::ports::{ClientFactoryRef, ConfigResolverRef};
use freenas_iscsi_provisioner::{
    ApiServer, ApiServerConfig, DeprovisionPolicy, Error, FileConfigResolver, HttpClientFactory,
    InMemoryAppliance, InMemoryClientFactory, KubeConfigResolver, Provisioner, ProvisionerConfig,
    ProvisionerMetrics, Result, RetryPolicy,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// FreeNAS iSCSI Provisioner - block volumes with saga-based rollback
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Identity stamped on provisioned volumes
    #[arg(long, env = "PROVISIONER_IDENTIFIER", default_value = "freenas-iscsi-provisioner")]
    identifier: String,

    /// YAML file of storage classes and secrets (reads the cluster when unset)
    #[arg(long, env = "STORAGE_CLASSES")]
    storage_classes: Option<PathBuf>,

    /// Run against an in-memory appliance (no FreeNAS, no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Datasets that exist on the in-memory appliance at startup
    #[arg(long, env = "STANDALONE_DATASETS", value_delimiter = ',', default_value = "tank")]
    standalone_datasets: Vec<String>,

    /// Extent create attempts while a new volume materializes
    #[arg(long, env = "EXTENT_RETRY_ATTEMPTS", default_value = "3")]
    extent_retry_attempts: u32,

    /// Seconds between extent create attempts
    #[arg(long, env = "EXTENT_RETRY_DELAY_SECS", default_value = "5")]
    extent_retry_delay_secs: u64,

    /// Deprovision error policy (best-effort, fail-fast)
    #[arg(long, env = "DEPROVISION_POLICY", default_value = "best-effort")]
    deprovision_policy: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting FreeNAS iSCSI Provisioner");
    info!("  Version: {}", freenas_iscsi_provisioner::VERSION);
    info!("  Identifier: {}", args.identifier);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let config = ProvisionerConfig {
        identifier: args.identifier.clone(),
        extent_retry: RetryPolicy::new(
            args.extent_retry_attempts,
            Duration::from_secs(args.extent_retry_delay_secs),
        ),
        deprovision_policy: args.deprovision_policy.parse::<DeprovisionPolicy>()?,
    };
    info!(
        "  Extent retry: {} attempts, {:?} apart",
        config.extent_retry.max_attempts, config.extent_retry.delay
    );
    info!("  Deprovision policy: {}", config.deprovision_policy);

    let resolver = build_resolver(&args).await?;
    let clients = build_client_factory(&args);
    let metrics = Arc::new(ProvisionerMetrics::new()?);

    let provisioner = Provisioner::new(config, resolver, clients, metrics.clone());

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
    };
    let api_server = Arc::new(ApiServer::new(api_config, provisioner));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_server.shutdown();
        }
    });

    api_server.run().await?;

    info!("Provisioner shutdown complete");
    Ok(())
}

async fn build_resolver(args: &Args) -> Result<ConfigResolverRef> {
    match &args.storage_classes {
        Some(path) => Ok(Arc::new(FileConfigResolver::load(path)?)),
        None if args.standalone => Err(Error::Configuration(
            "--standalone requires --storage-classes".into(),
        )),
        None => {
            let client = kube::Client::try_default().await?;
            info!("Resolving storage classes from the cluster");
            Ok(Arc::new(KubeConfigResolver::new(client)))
        }
    }
}

fn build_client_factory(args: &Args) -> ClientFactoryRef {
    if args.standalone {
        let appliance = args
            .standalone_datasets
            .iter()
            .filter(|d| !d.trim().is_empty())
            .fold(InMemoryAppliance::default(), |appliance, dataset| {
                appliance.with_dataset(dataset.trim())
            });
        info!(
            "Using in-memory appliance with datasets {:?}",
            args.standalone_datasets
        );
        Arc::new(InMemoryClientFactory::new(Arc::new(appliance)))
    } else {
        Arc::new(HttpClientFactory)
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<ProvisionerMetrics>) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    if req.uri().path() != "/metrics" {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        *response.body_mut() = Body::from("not found");
                        return Ok::<_, std::convert::Infallible>(response);
                    }
                    match metrics.encode() {
                        Ok((content_type, buffer)) => {
                            if let Ok(value) = content_type.parse() {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            *response.body_mut() = Body::from(buffer);
                        }
                        Err(e) => {
                            error!("{}", e);
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
