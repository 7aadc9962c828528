//! Tail the raw log, drop duplicates and write normalized records to the output log.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stream_common::health::HealthRegistry;
use stream_common::logfile::RotatingLogWriter;
use stream_common::metrics::{serve, setup_status_router};
use stream_common::signals::shutdown_token;
use stream_consumer::config::{Config, MembershipBackend};
use stream_consumer::consumer::Consumer;
use stream_consumer::error::ConsumerError;
use stream_consumer::membership::{InMemoryMembership, MembershipStore, RedisMembership};
use stream_consumer::normalizer::Normalizer;
use stream_consumer::rebuild::{rebuild_from_output, RebuildPolicy};
use stream_consumer::redis::RedisClient;
use stream_consumer::reporter::MetricsReporter;
use stream_consumer::sink::LogSink;
use stream_consumer::stats::ConsumerStats;
use stream_consumer::tailer::LogTailer;

async fn membership_store(config: &Config) -> Result<Arc<dyn MembershipStore>, ConsumerError> {
    let membership = &config.membership;
    Ok(match membership.backend {
        MembershipBackend::Memory => Arc::new(InMemoryMembership::new(
            membership.high_water,
            membership.evict_fraction,
        )),
        MembershipBackend::Redis => {
            let client = RedisClient::new(
                membership.redis_url.clone(),
                membership.redis_connect_timeout.0,
            )
            .await
            .map_err(|e| {
                ConsumerError::Configuration(format!("failed to create redis client: {:#}", e))
            })?;
            Arc::new(RedisMembership::new(
                client,
                &membership.key_prefix,
                config.membership_ttl(),
            ))
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().inspect_err(|e| error!(error = %e, "invalid configuration"))?;
    config
        .validate()
        .inspect_err(|e| error!(error = %e, "invalid configuration"))?;

    let liveness = HealthRegistry::new();
    let tailer_liveness = liveness.register("log_tailer", config.tailer_liveness_deadline());
    let reporter_liveness = liveness.register("metrics_reporter", config.reporter_liveness_deadline());

    let store = membership_store(&config).await?;
    if config.membership.rebuild == RebuildPolicy::OutputLog {
        rebuild_from_output(
            store.as_ref(),
            &config.output_dir(),
            config.output_prefix.as_str(),
        )
        .await?;
    }

    let writer = RotatingLogWriter::open(
        config.output_dir(),
        config.output_prefix.as_str(),
        config.output_max_file_bytes(),
        config.rotation_check_every,
    )
    .await
    .map_err(ConsumerError::OutputWrite)?;
    let sink = Arc::new(LogSink::new(writer, config.write_retries));

    let stats = Arc::new(ConsumerStats::new());
    let normalizer = Normalizer::new(store.clone(), sink, stats.clone()).with_store_retries(
        config.membership.store_retries,
        config.membership.store_retry_delay.0,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_status_router("stream-consumer", liveness);
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    // The reporter outlives the tailer so that its last snapshot covers drained work
    let reporter_cancel = CancellationToken::new();
    let reporter = MetricsReporter::new(
        stats,
        store,
        config.metrics_file(),
        config.metrics_interval.0,
        config.error_rate_warn_threshold,
    )
    .with_liveness(reporter_liveness);
    let reporter = tokio::spawn(reporter.run(reporter_cancel.clone()));

    let tailer = LogTailer::new(
        config.data_dir.clone(),
        config.raw_prefix.as_str(),
        config.tailer_options(),
        shutdown_token(),
    )
    .with_liveness(tailer_liveness);

    info!(
        dir = %config.data_dir.display(),
        output = %config.output_dir().display(),
        workers = config.workers,
        "starting consumer"
    );
    let result = Consumer::new(tailer, normalizer)
        .with_workers(config.workers, config.queue_capacity)
        .run()
        .await;

    reporter_cancel.cancel();
    if let Err(e) = reporter.await {
        error!(error = %e, "metrics reporter panicked");
    }

    if let Err(e) = &result {
        error!(error = %e, "consumer stopped on a fatal error");
    }
    result
}
