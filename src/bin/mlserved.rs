//! `mlserved`: the `mlserve` process entry point.
//!
//! Wires the configuration store, the application registrar, and the HTTP and ZMQ frontends
//! together around a shared [`QueryProcessor`]. The model-RPC path itself is out of scope
//! (`spec.md` §1); this binary plugs in [`NullDispatcher`], which always falls back to an
//! application's default output, so the process is runnable standalone. Operators wiring a real
//! worker fleet provide their own [`ModelDispatcher`] and swap it in here.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use clap::Parser;
use mlserve::{
    http_router, query::processor::{DispatchError, ModelDispatcher, QueryProcessor, WorkerResponse},
    query::{Query, VersionedModelId},
    AppConfig, AppRegistry, ConfigStore, HttpState, MetricsRegistry, Registrar,
    ServiceConfigBuilder, ZmqFrontend,
};
use tracing::{error, info};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file. Missing is not an error; defaults and `MLSERVE_*`
    /// environment variables still apply.
    #[arg(short, long, value_name = "FILE", env = "MLSERVE_CONFIG_FILE", default_value = "mlserve.yaml")]
    config_file: String,
}

/// Standing in for a real worker-fleet dispatcher until one is plugged in.
///
/// Never succeeds; every query falls through to its application's default output, exercising the
/// same fallback path a deadline miss would (`spec.md` §4.3).
struct NullDispatcher;

#[async_trait]
impl ModelDispatcher for NullDispatcher {
    async fn dispatch(
        &self,
        _model: &VersionedModelId,
        _query: &Query,
    ) -> Result<WorkerResponse, DispatchError> {
        Err(DispatchError::Failed(
            "no model-RPC path configured for this process".into(),
        ))
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = ServiceConfigBuilder::new()
        .with_file(&args.config_file)
        .with_env("MLSERVE")
        .build::<AppConfig>()?;
    config.runtime.build()?.block_on(run(config))
}

async fn run(config: AppConfig) -> Result<(), anyhow::Error> {
    let mut handle = config.handle()?;

    let metrics = MetricsRegistry::new(config.metrics.clone());
    metrics.spawn_tick_task();

    let dispatcher: Arc<dyn ModelDispatcher> = Arc::new(NullDispatcher);
    let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics)?);
    let registry = AppRegistry::new();

    let config_store = Arc::new(ConfigStore::connect(config.config_store.clone()).await);
    let registrar = Registrar::new(registry.clone(), processor.clone());
    let mut registrar_task = registrar.spawn(config_store);

    let zmq_frontend = ZmqFrontend::spawn(
        config.zmq.clone(),
        registry.clone(),
        processor.clone(),
        &metrics,
    )?;

    let http_state = HttpState::new(registry, processor);
    let router = http_router(http_state, metrics);
    let make_service = router.into_make_service_with_connect_info::<SocketAddr>();

    handle.start(config.server, make_service).await?;
    info!("mlserve is running");

    let result = tokio::select! {
        res = handle.wait() => res.map_err(Into::into),
        res = &mut registrar_task => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(anyhow::Error::new(err)),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        },
    };

    if !registrar_task.is_finished() {
        registrar_task.abort();
    }
    drop(zmq_frontend);

    if let Err(err) = &result {
        error!(error = %err, "mlserve shutting down due to a fatal error");
    }
    result
}
