use async_trait::async_trait;
use cache::{Cache, CacheError, MemoizeCache, MemoryCache, RedisCache};
use cache::memoize::CounterMemoizeMetrics;
use clients::{
    HttpClientService, MetricsQueue, MetricsService, MetricsStreamStore, MetricsWorker,
};
use domain::client::{ClientService, UpstreamError};
use domain::message::SseMessage;
use domain::metrics::MetricStore;
use domain::status::ConfigState;
use domain::stream::{MessageHandler, NoOpMessageHandler, Stream, StreamError};
use domain::sync::{ConnectedStreams, SharedCredentials};
use metrics_exporter_prometheus::PrometheusBuilder;
use proxy::config_loader::{ConfigError, RemoteConfig};
use proxy::offline::{self, OfflineError};
use proxy::transport::MetricsRenderer;
use proxy::{EdgeService, ProxyHealth, ProxyService, TokenSource};
use redis::IntoConnectionInfo;
use repository::{AuthRepo, FlagRepo, InventoryRepo, SegmentRepo, TargetRepo};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use stream::refresher::PopulateFn;
use stream::{
    ControlMessageHandler, Forwarder, PrimaryHealth, Pushpin, RedisStream, Refresher,
    ReplicaHealth, ReplicaStreamDisconnect, SaasOnConnect, SaasOnDisconnect, SseClient,
    StreamHealth, StreamWorker, topics,
};
use stream::handlers::ReloadFn;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod options;
use options::Options;

/// Control URI of the push gateway that holds the SDK connections.
const PUSHPIN_CONTROL_URI: &str = "http://localhost:5561";

const MEMOIZE_TTL: Duration = Duration::from_secs(60);
const VERIFY_STREAM_STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
enum StartupError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to connect to the shared store: {0}")]
    Store(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Offline(#[from] OfflineError),

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

fn main() {
    let options = Options::load();
    init_tracing(&options.log_level);

    if let Err(e) = options.validate() {
        tracing::error!(error = %e, "invalid configuration");
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to create runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(options)) {
        tracing::error!(error = %e, "startup error");
        process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let default_filter = level.to_lowercase();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

async fn run(options: Options) -> Result<(), StartupError> {
    tracing::info!(
        port = options.port,
        prometheus_port = options.prometheus_port,
        read_replica = options.read_replica,
        offline = options.offline,
        redis_address = %options.redis_address,
        client_service = %options.client_service,
        metric_service = %options.metric_service,
        bypass_auth = options.bypass_auth,
        and_rules = options.and_rules,
        "service config"
    );

    let metrics_renderer = install_prometheus(&options)?;
    describe_metrics();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received interrupt, shutting down");
            cancel.cancel();
        }
    });

    // The offline config generator always runs against an in-process cache
    let use_redis = !options.redis_address.is_empty() && !options.generate_offline_config;
    let (cache_impl, redis_stream): (Arc<dyn Cache>, Option<Arc<RedisStream>>) = if use_redis {
        let client = new_redis_client(&options)?;
        let manager = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StartupError::Store(e.to_string()))?;
        let stream = RedisStream::connect(client).await?;
        (Arc::new(RedisCache::new(manager)), Some(Arc::new(stream)))
    } else {
        tracing::info!("initialising in-process cache");
        (Arc::new(MemoryCache::new()), None)
    };

    let memoize = MemoizeCache::new(cache_impl, MEMOIZE_TTL, Arc::new(CounterMemoizeMetrics));
    memoize.health_check().await?;

    let auth_repo = AuthRepo::new(memoize.clone());
    let flag_repo = FlagRepo::new(memoize.clone());
    let segment_repo = SegmentRepo::new(memoize.clone());
    let target_repo = TargetRepo::new(memoize.clone());
    let inventory_repo = InventoryRepo::new(memoize.clone());

    let connected_streams = ConnectedStreams::new();
    let pushpin = Arc::new(Pushpin::new(PUSHPIN_CONTROL_URI)?);
    let bus: Arc<dyn Stream> = match &redis_stream {
        Some(stream) => stream.clone(),
        None => Arc::new(NoOpStream),
    };

    let metrics_enabled = options.metric_post_duration != 0 && !options.offline;

    let (stream_health, proxy_health, metric_store, cluster_identifier);

    if options.read_replica {
        // Replica: mirror stream health from the cache snapshot and the
        // control bus; serve SDK traffic from the shared cache; write
        // metrics through to the capped internal stream.
        let replica_health = Arc::new(ReplicaHealth::new());
        tokio::spawn({
            let health = replica_health.clone();
            let cache = memoize.clone();
            let cancel = cancel.clone();
            async move { health.snapshot_cached_status(&cache, cancel).await }
        });
        stream_health = replica_health.clone() as Arc<dyn StreamHealth>;

        proxy_health = Arc::new(ProxyHealth::new(
            ConfigState::ReadReplica,
            stream_health.clone(),
            memoize.clone(),
        ));

        let sse_fanout = StreamWorker::new(
            topics::SSE_EVENTS,
            bus.clone(),
            Arc::new(Forwarder::new(pushpin.clone(), Arc::new(NoOpMessageHandler))),
        )
        .with_on_disconnect(Arc::new(ReplicaStreamDisconnect::new(topics::SSE_EVENTS)));
        sse_fanout.spawn(cancel.clone());

        let control = StreamWorker::new(
            topics::CONTROL_EVENTS,
            bus.clone(),
            Arc::new(ControlMessageHandler::new(
                replica_health,
                pushpin.clone(),
                connected_streams.clone(),
            )),
        )
        .with_on_disconnect(Arc::new(ReplicaStreamDisconnect::new(topics::CONTROL_EVENTS)));
        control.spawn(cancel.clone());

        let Some(shared_stream) = &redis_stream else {
            return Err(StartupError::InvalidConfig(
                "read replicas require a shared store".to_string(),
            ));
        };
        let metrics_stream = shared_stream
            .as_ref()
            .clone()
            .with_max_len(options.metrics_stream_max_len);
        metric_store = Arc::new(MetricsStreamStore::new(
            Arc::new(metrics_stream),
            topics::METRICS_EVENTS,
        )) as Arc<dyn MetricStore>;

        cluster_identifier = "1".to_string();
    } else {
        // Primary: the sole talker to the upstream. Fetch and populate the
        // cache, then subscribe to the upstream SSE stream fanning events
        // out to SDKs first, replicas second, cache reconciliation last.
        let creds = SharedCredentials::new(options.proxy_key.clone());
        let client_service: Arc<dyn ClientService> =
            Arc::new(HttpClientService::new(&options.client_service)?);
        let remote_config = RemoteConfig::new(
            creds.clone(),
            client_service.clone(),
            bus.clone(),
            topics::SSE_EVENTS,
        );

        let primary_health = Arc::new(PrimaryHealth::new(memoize.clone()).await?);
        tokio::spawn({
            let health = primary_health.clone();
            let cancel = cancel.clone();
            async move {
                health
                    .verify_stream_status(VERIFY_STREAM_STATUS_INTERVAL, cancel)
                    .await
            }
        });
        stream_health = primary_health as Arc<dyn StreamHealth>;

        proxy_health = Arc::new(ProxyHealth::new(
            ConfigState::Synced,
            stream_health.clone(),
            memoize.clone(),
        ));

        if options.offline {
            let environments = offline::load_config_dir(Path::new(&options.config_dir))?;
            offline::populate_offline(
                environments,
                &auth_repo,
                &flag_repo,
                &segment_repo,
                &target_repo,
            )
            .await?;
        } else {
            let environments = remote_config
                .fetch_and_populate(&inventory_repo, &auth_repo, &flag_repo, &segment_repo)
                .await?;

            if options.generate_offline_config {
                offline::export(
                    Path::new(&options.config_dir),
                    &environments,
                    &auth_repo,
                    &flag_repo,
                    &segment_repo,
                    &target_repo,
                )
                .await?;
                tracing::info!(dir = %options.config_dir, "offline config generated");
                return Ok(());
            }

            let reload = reload_fn(
                remote_config.clone(),
                inventory_repo.clone(),
                auth_repo.clone(),
                flag_repo.clone(),
                segment_repo.clone(),
                proxy_health.clone(),
            );
            spawn_saas_stream(
                &options,
                &creds,
                client_service.clone(),
                reload,
                bus.clone(),
                pushpin.clone(),
                stream_health.clone(),
                connected_streams.clone(),
                auth_repo.clone(),
                flag_repo.clone(),
                segment_repo.clone(),
                redis_stream.clone(),
                cancel.clone(),
            )?;
        }

        // Aggregation queue plus the worker that drains replica metrics and
        // posts batches upstream
        let flush_interval = Duration::from_secs(options.metric_post_duration.max(1));
        let (queue, flush_rx) = MetricsQueue::new(cancel.clone(), flush_interval, flush_interval);
        metric_store = queue.clone() as Arc<dyn MetricStore>;

        if metrics_enabled {
            let metrics_service = Arc::new(MetricsService::new(
                &options.metric_service,
                creds.clone(),
            )?);
            match &redis_stream {
                Some(stream) => {
                    let worker = MetricsWorker::new(
                        queue,
                        metrics_service,
                        stream.clone(),
                        topics::METRICS_EVENTS,
                        options.metric_stream_read_concurrency,
                    );
                    worker.start(flush_rx, cancel.clone());
                }
                None => {
                    tokio::spawn(clients::worker::forward_flushes(metrics_service, flush_rx));
                }
            }
        } else {
            // Keep the flush channel drained so the queue never backs up
            tokio::spawn(async move {
                let mut flush_rx = flush_rx;
                while flush_rx.recv().await.is_some() {}
            });
        }

        cluster_identifier = creds.cluster_identifier();
    }

    let token_source = TokenSource::new(
        auth_repo.clone(),
        options.auth_secret.as_bytes(),
        cluster_identifier,
    );
    let service = Arc::new(ProxyService::new(
        flag_repo,
        segment_repo,
        target_repo,
        auth_repo,
        token_source,
        metric_store,
        stream_health,
        connected_streams,
        proxy_health,
        options.forward_targets,
    ));

    let mut edge = EdgeService::new(service, options.auth_secret.as_bytes(), options.bypass_auth);
    if let Some(renderer) = metrics_renderer {
        edge = edge.with_metrics_renderer(renderer);
    }

    let tls = if options.tls_enabled {
        Some(shared::http::tls_acceptor(
            Path::new(&options.tls_cert),
            Path::new(&options.tls_key),
        )?)
    } else {
        None
    };

    let protocol = if options.tls_enabled { "https" } else { "http" };
    tokio::spawn(proxy::health::heartbeat(
        format!("{protocol}://localhost:{}/health", options.port),
        Duration::from_secs(options.heartbeat_interval),
        cancel.clone(),
    ));

    tracing::info!(port = options.port, "starting relay server");
    shared::http::run_http_service("0.0.0.0", options.port, edge, tls, cancel).await?;
    Ok(())
}

/// Builds the closure the connect/disconnect handlers use to force a full
/// config refresh, keeping the health endpoint's config status current.
fn reload_fn(
    remote_config: RemoteConfig,
    inventory_repo: InventoryRepo,
    auth_repo: AuthRepo,
    flag_repo: FlagRepo,
    segment_repo: SegmentRepo,
    proxy_health: Arc<ProxyHealth>,
) -> ReloadFn {
    Arc::new(move || {
        let remote_config = remote_config.clone();
        let inventory_repo = inventory_repo.clone();
        let auth_repo = auth_repo.clone();
        let flag_repo = flag_repo.clone();
        let segment_repo = segment_repo.clone();
        let proxy_health = proxy_health.clone();
        Box::pin(async move {
            match remote_config
                .fetch_and_populate(&inventory_repo, &auth_repo, &flag_repo, &segment_repo)
                .await
            {
                Ok(_) => {
                    proxy_health.set_config_status(ConfigState::Synced);
                    Ok(())
                }
                Err(e) => {
                    proxy_health.set_config_status(ConfigState::FailedToSync);
                    Err(Box::new(e) as domain::stream::DynError)
                }
            }
        })
    })
}

/// Wires the Primary's upstream SSE subscription: every received message
/// flows through the pushpin forwarder, then the internal bus forwarder,
/// then the refresher, so SDK fan-out is never blocked by cache writes.
#[allow(clippy::too_many_arguments)]
fn spawn_saas_stream(
    options: &Options,
    creds: &SharedCredentials,
    client_service: Arc<dyn ClientService>,
    reload: ReloadFn,
    bus: Arc<dyn Stream>,
    pushpin: Arc<Pushpin>,
    stream_health: Arc<dyn StreamHealth>,
    connected_streams: ConnectedStreams,
    auth_repo: AuthRepo,
    flag_repo: FlagRepo,
    segment_repo: SegmentRepo,
    redis_stream: Option<Arc<RedisStream>>,
    cancel: CancellationToken,
) -> Result<(), StartupError> {
    let populate: PopulateFn = {
        let auth_repo = auth_repo.clone();
        let flag_repo = flag_repo.clone();
        let segment_repo = segment_repo.clone();
        Arc::new(move |config| {
            let auth_repo = auth_repo.clone();
            let flag_repo = flag_repo.clone();
            let segment_repo = segment_repo.clone();
            Box::pin(async move {
                proxy::populate(config, &auth_repo, &flag_repo, &segment_repo)
                    .await
                    .map_err(|e| Box::new(e) as domain::stream::DynError)
            })
        })
    };

    let refresher = Arc::new(Refresher::new(
        client_service,
        creds.clone(),
        auth_repo,
        flag_repo,
        segment_repo,
        populate,
    ));

    let tail: Arc<dyn MessageHandler> = match redis_stream {
        Some(stream) => Arc::new(
            Forwarder::new(stream, refresher).with_topic(topics::SSE_EVENTS),
        ),
        None => refresher,
    };
    let handler = Arc::new(Forwarder::new(pushpin.clone(), tail));

    let on_connect = Arc::new(SaasOnConnect::new(
        stream_health.clone(),
        reload.clone(),
        bus.clone(),
        topics::CONTROL_EVENTS,
    ));
    let on_disconnect = Arc::new(SaasOnDisconnect::new(
        stream_health,
        pushpin,
        bus,
        topics::CONTROL_EVENTS,
        connected_streams,
        reload,
    ));

    let stream_url = format!(
        "{}/stream?cluster={}",
        options.client_service,
        creds.cluster_identifier()
    );
    let sse_client = SseClient::new(stream_url, creds.clone())?
        .with_on_connect(on_connect)
        .with_on_disconnect(on_disconnect);

    StreamWorker::new("*", Arc::new(sse_client), handler).spawn(cancel);
    Ok(())
}

fn new_redis_client(options: &Options) -> Result<redis::Client, StartupError> {
    let url = cache::keyval::connection_url(&options.redis_address);
    let mut info = url
        .as_str()
        .into_connection_info()
        .map_err(|e| StartupError::InvalidConfig(format!("invalid redis address: {e}")))?;

    info.redis.db = options.redis_db;
    if !options.redis_password.is_empty() {
        info.redis.password = Some(options.redis_password.clone());
    }

    tracing::info!(address = %options.redis_address, "connecting to the shared store");
    redis::Client::open(info).map_err(|e| StartupError::Store(e.to_string()))
}

fn install_prometheus(options: &Options) -> Result<Option<MetricsRenderer>, StartupError> {
    // A dedicated exporter listener unless the metrics port matches the
    // main server port, in which case /metrics is served from the relay
    if options.prometheus_port == options.port {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| StartupError::Metrics(e.to_string()))?;
        Ok(Some(Arc::new(move || handle.render())))
    } else {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], options.prometheus_port))
            .install()
            .map_err(|e| StartupError::Metrics(e.to_string()))?;
        Ok(None)
    }
}

fn describe_metrics() {
    shared::metrics_defs::describe_all(cache::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(stream::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(clients::metrics_defs::ALL_METRICS);
}

/// Stands in for the internal bus when no shared store is configured.
/// Publishes vanish and subscriptions fail so the backoff loop keeps the
/// worker parked.
struct NoOpStream;

#[async_trait]
impl Stream for NoOpStream {
    async fn publish(&self, _topic: &str, _msg: &SseMessage) -> Result<(), StreamError> {
        Ok(())
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _from_id: Option<String>,
        _handler: Arc<dyn MessageHandler>,
        _cancel: CancellationToken,
    ) -> Result<(), StreamError> {
        Err(StreamError::Subscribe(
            "no shared stream store configured".to_string(),
        ))
    }
}
