//! Image Registry Operator
//!
//! Provisions the registry's backing storage and reports registry health.

use clap::Parser;
use kube::runtime::{reflector, watcher};
use kube::{Api, Client};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use image_registry_operator::adapters::{DeploymentApplier, KubeObjectApi, StoreLister};
use image_registry_operator::config::{
    DEPLOYMENT_NAME, PRUNER_JOB_LABEL, PRUNER_RESOURCE_NAME, REGISTRY_RESOURCE_NAME,
};
use image_registry_operator::controller::events::watch;
use image_registry_operator::{
    run_worker, CredentialCache, DriverContext, Error, EventHandler, ImagePruner,
    ImageRegistryConfig, Metrics, OperatorConfig, Platform, PrunerController, RegistryController,
    Result, Route, StorageApplier, WorkQueue,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Image Registry Operator - storage provisioning and health reporting
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace of the registry workload
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "openshift-image-registry")]
    namespace: String,

    /// Infrastructure platform (aws, azure, ibmcloud, alibabacloud, none)
    #[arg(long, env = "PLATFORM", default_value = "none")]
    platform: Platform,

    /// Default cloud region
    #[arg(long, env = "REGION", default_value = "")]
    region: String,

    /// Cluster infrastructure name, used as prefix of generated names
    #[arg(long, env = "INFRASTRUCTURE_NAME", default_value = "")]
    infrastructure_name: String,

    /// Registry workload image
    #[arg(long, env = "REGISTRY_IMAGE", default_value = image_registry_operator::config::DEFAULT_REGISTRY_IMAGE)]
    registry_image: String,

    /// Credential cache TTL in seconds
    #[arg(long, env = "CREDENTIAL_CACHE_TTL", default_value = "1200")]
    credential_cache_ttl_secs: u64,

    /// Number of storage accounts whose keys are cached
    #[arg(long, env = "CREDENTIAL_CACHE_CAPACITY", default_value = "8")]
    credential_cache_capacity: usize,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: self.namespace.clone(),
            platform: self.platform,
            region: self.region.clone(),
            infrastructure_name: self.infrastructure_name.clone(),
            credential_cache_ttl: Duration::from_secs(self.credential_cache_ttl_secs),
            credential_cache_capacity: self.credential_cache_capacity,
            registry_image: self.registry_image.clone(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.operator_config();
    info!("Starting Image Registry Operator");
    info!("  Version: {}", image_registry_operator::VERSION);
    info!("  Namespace: {}", config.namespace);
    info!("  Platform: {}", config.platform);
    info!("  Infrastructure: {}", config.infrastructure_name);

    let client = Client::try_default().await?;
    let metrics = Arc::new(Metrics::new()?);
    let shutdown = CancellationToken::new();
    let ns = config.namespace.as_str();

    // Registry controller inputs
    let registry_queue = WorkQueue::new(
        "imageregistry",
        config.queue_initial_backoff,
        config.queue_max_backoff,
    );
    let registry_events = EventHandler::new(registry_queue.clone(), REGISTRY_RESOURCE_NAME);

    let (configs, writer) = reflector::store::<ImageRegistryConfig>();
    tokio::spawn(watch(
        Api::all(client.clone()),
        watcher::Config::default(),
        writer,
        registry_events.clone(),
        shutdown.clone(),
    ));
    let (deployments, writer) = reflector::store::<Deployment>();
    tokio::spawn(watch(
        Api::namespaced(client.clone(), ns),
        watcher::Config::default().fields(&format!("metadata.name={}", DEPLOYMENT_NAME)),
        writer,
        registry_events.clone(),
        shutdown.clone(),
    ));
    let (routes, writer) = reflector::store::<Route>();
    tokio::spawn(watch(
        Api::namespaced(client.clone(), ns),
        watcher::Config::default(),
        writer,
        registry_events.clone(),
        shutdown.clone(),
    ));
    let (secrets, writer) = reflector::store::<Secret>();
    tokio::spawn(watch(
        Api::namespaced(client.clone(), ns),
        watcher::Config::default(),
        writer,
        registry_events.clone(),
        shutdown.clone(),
    ));
    let (_claims, writer) = reflector::store::<PersistentVolumeClaim>();
    tokio::spawn(watch(
        Api::<PersistentVolumeClaim>::namespaced(client.clone(), ns),
        watcher::Config::default(),
        writer,
        registry_events.clone(),
        shutdown.clone(),
    ));

    // Pruner controller inputs
    let pruner_queue = WorkQueue::new(
        "imagepruner",
        config.queue_initial_backoff,
        config.queue_max_backoff,
    );
    let pruner_events = EventHandler::new(pruner_queue.clone(), PRUNER_RESOURCE_NAME);

    let (pruners, writer) = reflector::store::<ImagePruner>();
    tokio::spawn(watch(
        Api::all(client.clone()),
        watcher::Config::default(),
        writer,
        pruner_events.clone(),
        shutdown.clone(),
    ));
    let (cronjobs, writer) = reflector::store::<CronJob>();
    tokio::spawn(watch(
        Api::namespaced(client.clone(), ns),
        watcher::Config::default(),
        writer,
        pruner_events.clone(),
        shutdown.clone(),
    ));
    let (jobs, writer) = reflector::store::<Job>();
    tokio::spawn(watch(
        Api::namespaced(client.clone(), ns),
        watcher::Config::default()
            .labels(&format!("{}={}", PRUNER_JOB_LABEL.0, PRUNER_JOB_LABEL.1)),
        writer,
        pruner_events,
        shutdown.clone(),
    ));

    // Storage drivers. No cloud SDK client is linked into this build, so the
    // cloud backends stay unset and report Degraded instead of provisioning.
    warn!("cloud storage clients are not configured; only pvc, emptyDir and filesystem storage can be provisioned");
    let ctx = DriverContext {
        namespace: config.namespace.clone(),
        infrastructure_name: config.infrastructure_name.clone(),
        region: config.region.clone(),
        secrets: Arc::new(StoreLister::namespaced(secrets, ns)),
        claims: Arc::new(KubeObjectApi::<PersistentVolumeClaim>::new(
            Api::namespaced(client.clone(), ns),
            "PersistentVolumeClaim",
        )),
        azure: None,
        s3: None,
        oss: None,
        ibmcos: None,
        ibm_resources: None,
        credentials: Arc::new(CredentialCache::new(
            config.credential_cache_ttl,
            config.credential_cache_capacity,
            metrics.clone(),
        )),
        metrics: metrics.clone(),
    };
    let applier = StorageApplier::new(
        ctx,
        Arc::new(KubeObjectApi::<Secret>::new(
            Api::namespaced(client.clone(), ns),
            "Secret",
        )),
        Arc::new(DeploymentApplier::new(
            Api::namespaced(client.clone(), ns),
            ns,
            &config.registry_image,
        )),
    );

    let registry = RegistryController::new(
        Arc::new(StoreLister::cluster(configs)),
        Arc::new(KubeObjectApi::<ImageRegistryConfig>::new(
            Api::all(client.clone()),
            "Config",
        )),
        Arc::new(StoreLister::namespaced(deployments, ns)),
        Arc::new(StoreLister::namespaced(routes, ns)),
        applier,
        config.platform,
    );
    let pruner = PrunerController::new(
        Arc::new(StoreLister::cluster(pruners)),
        Arc::new(KubeObjectApi::<ImagePruner>::new(
            Api::all(client.clone()),
            "ImagePruner",
        )),
        Arc::new(StoreLister::namespaced(cronjobs, ns)),
        Arc::new(StoreLister::namespaced(jobs, ns)),
        metrics.clone(),
    );

    // Bootstrap runs even when no object exists yet
    registry_queue.add(REGISTRY_RESOURCE_NAME);
    pruner_queue.add(PRUNER_RESOURCE_NAME);

    let workers = vec![
        tokio::spawn(run_worker(registry_queue.clone(), Arc::new(registry))),
        tokio::spawn(run_worker(pruner_queue.clone(), Arc::new(pruner))),
    ];

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let server_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight syncs");

    shutdown.cancel();
    registry_queue.shutdown();
    pruner_queue.shutdown();
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task failed: {}", e);
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    let directives = format!("{},hyper=warn,kube=info,tower=warn", level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

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

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

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

async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match (req.uri().path(), metrics.encode()) {
                        ("/metrics", Ok(buffer)) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = "text/plain; version=0.0.4".parse() {
                                response.headers_mut().insert("Content-Type", value);
                            }
                            response
                        }
                        ("/metrics", Err(e)) => {
                            error!("Unable to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "error")
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
