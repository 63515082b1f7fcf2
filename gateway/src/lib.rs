pub mod config;
pub mod errors;
pub mod metrics_defs;
mod routes;
pub mod service;

use crate::errors::GatewayError;
use crate::service::GatewayService;
use engine::Engine;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

pub async fn run(config: config::Config) -> Result<(), GatewayError> {
    config.validate()?;
    let engine = Engine::from_config(&config.engine)?;

    // Ready once at least one scope can actually reach a client
    let ready = !engine.service().registry().details().is_empty();
    if !ready {
        tracing::warn!("No scope has clients configured, reporting not ready");
    }

    let max_upload_bytes = usize::try_from(config.engine.provider.max_download_bytes).unwrap_or(usize::MAX);
    let gateway_service = GatewayService::new(Arc::new(engine), max_upload_bytes);
    let gateway_task = run_http_service(&config.listener.host, config.listener.port, gateway_service);

    let admin_service = AdminService::<_, GatewayError>::new(move || ready);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(gateway_task, admin_task)?;
    Ok(())
}
