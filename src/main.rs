use std::error::Error;
use std::sync::Arc;

use stand_tools::{
    backend::{self, OperationTimeouts},
    build::{BuildClient, JenkinsApi},
    config::{
        StandConfig,
        loader::{CONFIG_PATH_VAR, DEFAULT_CONFIG_PATH},
        logging,
    },
    engine::{Engine, EngineSettings, HttpProbe, files},
    process::ProcessSupervisor,
    worker::{StandServer, Worker},
};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = StandConfig::load(&config_path)?;
    logging::init(&config.log_level, &config.log_format);
    config.log_summary();

    let layout = config.layout();
    files::prepare_layout(&layout)?;

    let descriptor = config.connection_descriptor()?;
    let timeouts = OperationTimeouts::from(config.timeouts.clone());
    let db = backend::open_backend(descriptor, timeouts).await?;

    let jenkins = JenkinsApi::new(
        config.jenkins.url.clone().unwrap_or_default(),
        config.jenkins.user.clone().unwrap_or_default(),
        config.jenkins.password.clone().unwrap_or_default(),
    );
    let builds = BuildClient::new(
        Arc::new(jenkins),
        config.jenkins.project.clone(),
        config.jenkins.branch.clone(),
        config.jenkins.utc_offset_hours,
    )?;

    let engine = Arc::new(Engine::new(
        db,
        Arc::new(ProcessSupervisor::from_config(&config.application)),
        builds,
        Arc::new(HttpProbe::new(config.application.port)),
        layout,
        EngineSettings {
            remove_on_exit: config.db.rm,
            validate_entity_code: config.db.validate_entity_code,
        },
    ));

    if let Err(e) = engine.start_application().await {
        tracing::error!(error = %e, "Application did not start");
    }
    tracing::info!("Test tools started");

    let (worker, jobs) = Worker::start(engine.clone());
    let server = StandServer::new(worker, &config.engine_host, config.engine_port);
    let served = server.start_server(shutdown_signal()).await;

    // An in-flight task is abandoned; its console commands die with it.
    jobs.abort();
    engine.shutdown().await;

    served?;
    Ok(())
}
