pub mod assertion;
pub mod cas;
pub mod config;
pub mod connectors;
pub mod crypto;
pub mod dispatch;
pub mod errors;
pub mod keys;
pub mod metrics_defs;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod session_init;
pub mod service;
pub mod token;
pub mod upload;
pub mod wrapper;

#[cfg(test)]
mod testutils;

use errors::DispatcherError;
use registry::Dispatchers;
use service::WorkbenchService;
use session::SessionStore;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;

const KEYSTORE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(config: config::Config) -> Result<(), DispatcherError> {
    config.validate()?;

    let resolver = Arc::new(config.services.build_resolver()?);
    let dispatchers = Dispatchers::from_config(&config, resolver)?;
    let sessions = Arc::new(SessionStore::new(&config.sessions));
    let workbench = WorkbenchService::new(&config, &dispatchers, sessions)?;
    dispatchers.preload_keys(KEYSTORE_RETRY_INTERVAL);

    let workbench_task = run_http_service(&config.listener.host, config.listener.port, workbench);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<_, DispatcherError>::new(dispatchers.readiness()),
    );

    tokio::try_join!(workbench_task, admin_task)?;
    Ok(())
}
