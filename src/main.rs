//! toolbridge - serve local capabilities to approved peers.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use toolbridge::approval::{ApprovalCoordinator, ConsolePrompt};
use toolbridge::capability::{CapabilityProvider, CapabilityRegistry, FilesProvider, SystemProvider};
use toolbridge::discovery::{
    DiscoveryManager, MdnsAdvertiser, NoopAdvertiser, ServiceAdvertiser,
};
use toolbridge::manager::{ManagerConfig, SessionManager, ToolCatalog};
use toolbridge::notify::LogNotifier;
use toolbridge::session::SessionConfig;
use toolbridge::{Config, SettingsStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolbridge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    info!("Starting toolbridge {}", env!("CARGO_PKG_VERSION"));

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    let settings = Arc::new(SettingsStore::new(&config.data_dir).await);
    info!("Settings at {}", settings.storage_path().display());

    let registry = CapabilityRegistry::new()
        .with_provider(Arc::new(FilesProvider::new(&config.files_root)))
        .with_provider(Arc::new(SystemProvider::new()));
    for provider in registry.providers() {
        activate(provider.as_ref()).await;
    }

    let bindings = settings.capability_bindings(&registry.ids());
    let catalog = Arc::new(ToolCatalog::new(registry, settings.is_enabled(), bindings));

    let approvals = ApprovalCoordinator::spawn(
        Arc::clone(&settings),
        Arc::new(ConsolePrompt::new()),
        Arc::new(LogNotifier),
        config.approval.clone(),
    );

    let advertiser: Arc<dyn ServiceAdvertiser> = if config.advertise {
        match MdnsAdvertiser::new(&config.discovery.service_type, &config.discovery.instance_name) {
            Ok(advertiser) => Arc::new(advertiser),
            Err(e) => {
                warn!("{}; continuing without advertisement", e);
                Arc::new(NoopAdvertiser)
            }
        }
    } else {
        Arc::new(NoopAdvertiser)
    };
    let discovery = DiscoveryManager::new(config.discovery.clone(), advertiser);

    let manager = SessionManager::new(
        ManagerConfig {
            handshake_timeout: config.handshake_timeout,
            session: SessionConfig::default(),
        },
        discovery,
        catalog,
        approvals,
    );
    manager.start().await?;

    wait_for_shutdown(&manager, &settings).await;
    manager.stop();
    info!("Shut down");
    Ok(())
}

async fn activate(provider: &dyn CapabilityProvider) {
    if provider.activated().await {
        return;
    }
    if let Err(e) = provider.activate().await {
        warn!("Capability '{}' is not available: {}", provider.name(), e);
    }
}

/// Re-read settings.json and push the result into the running service.
#[cfg(unix)]
async fn reload(manager: &SessionManager, settings: &Arc<SettingsStore>) {
    if let Err(e) = settings.reload().await {
        error!("Failed to reload settings: {}", e);
        return;
    }
    if let Err(e) = manager.approvals().reload_trust().await {
        error!("Failed to reload trusted clients: {}", e);
    }
    manager.set_enabled(settings.is_enabled());
    let ids = manager.catalog().registry().ids();
    manager.update_capability_bindings(settings.capability_bindings(&ids));
    info!("Settings reloaded");
}

#[cfg(unix)]
async fn wait_for_shutdown(manager: &SessionManager, settings: &Arc<SettingsStore>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("SIGHUP reload unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = hangup.recv() => reload(manager, settings).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_manager: &SessionManager, _settings: &Arc<SettingsStore>) {
    let _ = tokio::signal::ctrl_c().await;
}
