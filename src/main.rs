use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use llm_router::config::{Args, RoutingLogic, ServiceDiscoveryKind};
use llm_router::discovery::{ServiceDiscovery, StaticServiceDiscovery};
use llm_router::metrics::Metrics;
use llm_router::proxy::kv_sidecar::KvReadySidecar;
use llm_router::proxy::{DisaggregatedConfig, Proxy, ProxyConfig};
use llm_router::queue::{AdmissionQueue, AdmissionThresholds};
use llm_router::routing::disaggregated::{DisaggregatedAffinity, SubStrategy};
use llm_router::routing::filters::TopPercentileQueueCutFilter;
use llm_router::routing::kv_aware::KvAwareAffinity;
use llm_router::routing::lowest_qps::LowestQpsPolicy;
use llm_router::routing::prefix::{HashTrieConfig, PrefixAffinity};
use llm_router::routing::round_robin::RoundRobinAffinity;
use llm_router::routing::session::SessionAffinity;
use llm_router::routing::simhash::SimhashAffinity;
use llm_router::routing::weighted::WeightedAffinity;
use llm_router::routing::{AffinityPolicy, EndpointFilter, Router as RoutingRouter};
use llm_router::state::{now_secs, AppState};
use llm_router::telemetry::{EngineStatsScraper, RequestStatsMonitor};
use llm_router::types::Endpoint;

fn build_affinity(args: &Args, weights: HashMap<String, u32>) -> Box<dyn AffinityPolicy> {
    match args.routing_logic {
        RoutingLogic::RoundRobin => Box::new(RoundRobinAffinity::new()),
        RoutingLogic::Session => Box::new(SessionAffinity::new()),
        RoutingLogic::Prefix => Box::new(PrefixAffinity::new(HashTrieConfig::default())),
        RoutingLogic::Simhash => Box::new(SimhashAffinity::new()),
        RoutingLogic::LowestQps => Box::new(LowestQpsPolicy::new()),
        RoutingLogic::Weighted => Box::new(WeightedAffinity::new(weights)),
        RoutingLogic::KvAware => Box::new(KvAwareAffinity::new()),
        RoutingLogic::Disaggregated => Box::new(DisaggregatedAffinity::new(SubStrategy::RoundRobin)),
    }
}

fn build_static_endpoints(args: &Args) -> Result<Vec<Endpoint>> {
    let urls = llm_router::config::parse_static_urls(
        args.static_backends
            .as_deref()
            .context("--static-backends is required for static discovery")?,
    );
    let models: Vec<String> = args
        .static_models
        .as_deref()
        .map(|s| s.split(',').map(str::trim).map(String::from).collect())
        .unwrap_or_default();
    let roles: Vec<String> = args
        .static_roles
        .as_deref()
        .map(|s| s.split(',').map(str::trim).map(String::from).collect())
        .unwrap_or_default();

    let mut endpoints = Vec::with_capacity(urls.len());
    for (i, url) in urls.into_iter().enumerate() {
        let model = models.get(i).cloned().unwrap_or_else(|| "default".to_string());
        let mut endpoint = Endpoint::new(url, vec![model]);
        endpoint.added_timestamp = now_secs();
        if let Some(role) = roles.get(i) {
            endpoint.role = match role.as_str() {
                "prefill" => Some(llm_router::types::EndpointRole::Prefill),
                "decode" => Some(llm_router::types::EndpointRole::Decode),
                "transcription" => Some(llm_router::types::EndpointRole::Transcription),
                _ => None,
            };
        }
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}

#[tokio::main]
async fn main() -> Result<()> {
    llm_router::logging::init();

    let args = Args::parse();
    args.validate().context("invalid CLI configuration")?;
    let routing_config = args.load_routing_config()?;

    let discovery: Arc<dyn ServiceDiscovery> = match args.service_discovery {
        ServiceDiscoveryKind::Static => {
            let endpoints = build_static_endpoints(&args)?;
            StaticServiceDiscovery::new(endpoints, Duration::from_secs(5))
        }
        ServiceDiscoveryKind::K8s => {
            anyhow::bail!(
                "k8s service discovery requires a pod-watch source to be wired in by the embedding application"
            );
        }
    };

    let engine_stats = Arc::new(EngineStatsScraper::new(Duration::from_secs_f64(
        args.engine_stats_interval,
    )));
    let request_stats = Arc::new(RequestStatsMonitor::new(args.request_stats_window));

    let filters: Vec<Box<dyn EndpointFilter>> = vec![Box::new(TopPercentileQueueCutFilter::new(
        routing_config.top_percentile_cut.unwrap_or(0.9),
    ))];
    let affinity = build_affinity(&args, routing_config.weights.clone().unwrap_or_default());
    let router = Arc::new(RoutingRouter::new(filters, affinity));

    let aliases = args
        .static_aliases
        .as_deref()
        .map(llm_router::config::parse_static_aliases)
        .unwrap_or_default();

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let disaggregated_cfg = if matches!(args.routing_logic, RoutingLogic::Disaggregated) {
        let kv_sidecar = Arc::new(KvReadySidecar::new());
        let sidecar_addr: SocketAddr = args
            .kv_sidecar_addr
            .parse()
            .context("invalid --kv-sidecar-addr")?;
        {
            let kv_sidecar = kv_sidecar.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = kv_sidecar.run(sidecar_addr, cancel).await {
                    tracing::error!(error = %e, "kv-ready sidecar exited with error");
                }
            });
        }
        Some(DisaggregatedConfig {
            kv_sidecar,
            kv_wait_timeout: Duration::from_secs_f64(args.kv_wait_timeout_secs),
            kv_receiver_host: args.kv_receiver_host.clone(),
            kv_receiver_init_port: args.kv_receiver_init_port,
            kv_receiver_alloc_port: args.kv_receiver_alloc_port,
        })
    } else {
        None
    };

    let proxy = Arc::new(Proxy::new(
        discovery.clone(),
        router.clone(),
        request_stats.clone(),
        None,
        ProxyConfig { aliases, max_failover_attempts: args.max_failover_attempts },
        disaggregated_cfg,
    ));

    let metrics = Arc::new(Metrics::new());
    let admission_waiters = Arc::new(parking_lot::Mutex::new(HashMap::new()));

    let queue = if args.enable_queue {
        let (queue, mut dispatch_rx) = AdmissionQueue::new(
            AdmissionThresholds::default(),
            Duration::from_secs_f64(routing_config.max_queue_wait_time_secs.unwrap_or(30.0)),
        );

        {
            let waiters = admission_waiters.clone();
            tasks.spawn(async move {
                while let Some(admission) = dispatch_rx.recv().await {
                    if let Some(tx) = waiters.lock().remove(&admission.request.request_id) {
                        let _ = tx.send(admission.endpoint_url);
                    }
                }
            });
        }

        // Schedulers run against the service-discovery snapshot at startup;
        // endpoints joining a `cluster` discovery backend after this point
        // are reachable for routing but won't have a dedicated admission
        // scheduler until the process restarts.
        for endpoint in discovery.snapshot() {
            let queue = queue.clone();
            let discovery = discovery.clone();
            let engine_stats = engine_stats.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                queue
                    .run_endpoint_scheduler(
                        endpoint,
                        move || discovery.snapshot(),
                        move || engine_stats.get_engine_stats(),
                        HashMap::new,
                        now_secs,
                        cancel,
                    )
                    .await;
            });
        }

        Some(queue)
    } else {
        None
    };

    let state = Arc::new(AppState {
        discovery: discovery.clone(),
        engine_stats: engine_stats.clone(),
        request_stats: request_stats.clone(),
        router,
        proxy,
        metrics,
        queue,
        admission_waiters,
        cancel: cancel.clone(),
        session_header: args.session_key.clone(),
    });

    {
        let engine_stats = engine_stats.clone();
        let discovery = discovery.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            engine_stats
                .run(move || discovery.snapshot().into_iter().map(|ep| ep.url).collect(), cancel)
                .await;
        });
    }

    if args.log_stats {
        let engine_stats = engine_stats.clone();
        let request_stats = request_stats.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_secs_f64(args.log_stats_interval);
        tasks.spawn(async move {
            llm_router::telemetry::log_stats::run(engine_stats, request_stats, interval, now_secs, cancel).await;
        });
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let app = llm_router::http::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "llm-router listening");

    let server_cancel = cancel.clone();
    tasks.spawn(async move {
        let serve = axum::serve(listener, app.into_make_service());
        tokio::select! {
            result = serve => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "http server exited with error");
                }
            }
            _ = server_cancel.cancelled() => {
                info!("http server shutting down");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    discovery.close().await;

    let shutdown = tokio::time::timeout(Duration::from_secs(10), async {
        while tasks.join_next().await.is_some() {}
    });
    if shutdown.await.is_err() {
        tracing::warn!("subsystems did not shut down within the bounded timeout");
    }

    Ok(())
}
