//! Read a server-sent events stream into a rotating raw log.
use envconfig::Envconfig;
use tracing::{error, info};

use stream_common::health::HealthRegistry;
use stream_common::logfile::RotatingLogWriter;
use stream_common::metrics::{serve, setup_status_router};
use stream_common::signals::shutdown_token;
use stream_reader::client::StreamClient;
use stream_reader::config::Config;
use stream_reader::error::ReaderError;
use stream_reader::reader::StreamReader;

#[tokio::main]
async fn main() -> Result<(), ReaderError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().inspect_err(|e| error!(error = %e, "invalid configuration"))?;
    config
        .validate()
        .inspect_err(|e| error!(error = %e, "invalid configuration"))?;

    let liveness = HealthRegistry::new();
    let reader_liveness = liveness.register("stream_reader", config.liveness_deadline());

    let client = StreamClient::new(
        config.stream_url()?,
        &config.user_agent(),
        config.connect_timeout.0,
        config.read_stall_timeout.0,
    )
    .map_err(|e| ReaderError::Configuration(format!("failed to build HTTP client: {}", e)))?;

    let writer = RotatingLogWriter::open(
        config.data_dir.clone(),
        config.raw_prefix.as_str(),
        config.max_file_bytes(),
        config.rotation_check_every,
    )
    .await
    .map_err(ReaderError::RawWrite)?;

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_status_router("stream-reader", liveness);
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let mut reader = StreamReader::new(
        client,
        writer,
        config.backoff_policy(),
        config.write_retries,
        config.progress_log_every,
        reader_liveness,
    );

    info!(url = %config.stream_url, dir = %config.data_dir.display(), "starting stream reader");
    reader.run(shutdown_token()).await?;

    Ok(())
}
