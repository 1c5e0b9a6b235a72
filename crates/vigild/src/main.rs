use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;
use vigil_core::{shared_runtime, OrtBackend, ScrfdModelFactory};
use vigild::dbus_interface::{SessionHost, VigilService, BUS_NAME, OBJECT_PATH};
use vigild::model_fetch::ModelSource;
use vigild::{Config, DetectorResolver, MonitorController, NoNativeDetector};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        model = %config.model_path().display(),
        system_bus = config.system_bus,
        "configuration loaded"
    );

    let resolver = DetectorResolver::new(
        Arc::new(NoNativeDetector),
        shared_runtime(),
        OrtBackend::candidates(),
        Arc::new(ScrfdModelFactory::new(config.model_path())),
    )
    .with_model_source(ModelSource {
        path: config.model_path(),
        url: config.model_url.clone(),
    });

    let controller = MonitorController::new(Arc::new(resolver));
    let mut states = controller.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            tracing::info!(
                monitoring = state.is_monitoring,
                detector_available = state.detector_available,
                source = ?state.detector_source,
                flags = ?state.flag_types(),
                error = state.error.as_deref().unwrap_or(""),
                "monitor state"
            );
        }
    });

    let host = Arc::new(Mutex::new(SessionHost::new(config.clone(), controller)));

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VigilService::new(Arc::clone(&host)))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "vigild ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");
    let (_, pending) = host.lock().await.end_session();
    pending.wait().await;

    Ok(())
}
