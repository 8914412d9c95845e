use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Builder;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use engine::config::{ConnectionConfig, TransportConfig};
use engine::operation::OperationDefaults;
use engine::registry::{OperationRegistry, RegistryEvent};
use engine::session::Session;
use engine::transport::{CertificatePolicy, PinnedCertificates, TlsConnector, TransportWorker};
use engine::{ConfigManager, RpcSession};

const CONFIG_DIR_ENV: &str = "ENGINE_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = "config";

struct Connection {
    name: String,
    worker: Arc<TransportWorker>,
    session: Arc<RpcSession>,
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("engine=info".parse()?)
        .add_directive("audit=info".parse()?)
        .add_directive("rustls=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    info!("Starting remote operation engine");

    let config_dir =
        std::env::var(CONFIG_DIR_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());

    // Config decides how big the runtime is, so load it on a throwaway one
    let config = Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(ConfigManager::new(config_dir.clone()))
        .with_context(|| format!("loading configuration from {}", config_dir))?
        .get_current_config();

    info!(
        "Configuration loaded: {} connections, {} operation threads",
        config.connections.len(),
        config.worker_threads
    );

    let defaults = OperationDefaults::from(config.as_ref());
    info!(
        "Operations poll every {:?} and tag tasks with '{}'",
        defaults.poll_interval, defaults.correlation_key
    );
    defaults.install();

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.worker_threads + config.connections.len())
        .thread_name("engine")
        .build()?;

    runtime.block_on(async move {
        let transport = config.transport_config();

        let mut connecting = Vec::new();
        for (name, settings) in config.connections.clone() {
            connecting.push(tokio::task::spawn_blocking(move || {
                connect(&name, &settings, transport).map_err(|e| (name, e))
            }));
        }

        let mut connections = Vec::new();
        for handle in connecting {
            match handle.await? {
                Ok(connection) => connections.push(connection),
                Err((name, e)) => error!("Connection '{}' unavailable: {:#}", name, e),
            }
        }

        if connections.is_empty() && !config.connections.is_empty() {
            warn!("No configured connection could be established");
        }

        let registry = OperationRegistry::global();
        let mut history = registry.subscribe();
        tokio::spawn(async move {
            loop {
                match history.recv().await {
                    Ok(RegistryEvent::Added(record)) => {
                        debug!("Operation added: {} ({})", record.title, record.id)
                    }
                    Ok(RegistryEvent::Updated(record)) => debug!(
                        "Operation {} ({}): {:?} {}%",
                        record.title, record.id, record.state, record.percent_complete
                    ),
                    Ok(RegistryEvent::Removed(id)) => debug!("Operation removed: {}", id),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("History listener skipped {} events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!(
            "Engine ready with {} live connections; press Ctrl-C to stop",
            connections.len()
        );

        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");

        tokio::task::spawn_blocking(move || {
            let swept = registry.prepare_for_restart();
            debug!("Restart sweep touched {} operations", swept);

            for connection in connections {
                if let Err(e) = connection.session.logout() {
                    warn!("Logout from '{}' failed: {}", connection.name, e);
                }
                connection.worker.shutdown();
                info!("Connection '{}' closed", connection.name);
            }
        })
        .await?;

        info!("Engine stopped");
        Ok::<(), anyhow::Error>(())
    })
}

/// Connects, waits for the handshake and logs in; runs on a blocking thread
fn connect(name: &str, settings: &ConnectionConfig, transport: TransportConfig) -> Result<Connection> {
    let policy = certificate_policy(name, settings)?;
    let connector = Arc::new(TlsConnector::new(settings.host.clone(), settings.port, policy));
    let worker = Arc::new(TransportWorker::new(connector, transport));

    worker.start()?;
    worker.wait_connected(transport.connect_timeout + transport.handshake_timeout)?;
    info!("Connected to {}:{} ('{}')", settings.host, settings.port, name);

    let session = RpcSession::login(worker.clone(), &settings.username, &settings.password)?;

    Ok(Connection {
        name: name.to_string(),
        worker,
        session,
    })
}

fn certificate_policy(name: &str, settings: &ConnectionConfig) -> Result<CertificatePolicy> {
    if settings.accept_self_signed {
        return Ok(CertificatePolicy::AcceptAll);
    }

    let pinned = match &settings.trusted_certificate {
        Some(path) => PinnedCertificates::from_pem_file(Path::new(path))?,
        None => {
            warn!(
                "Connection '{}' neither accepts self-signed certificates nor pins one; \
                 every certificate will be rejected",
                name
            );
            PinnedCertificates::default()
        }
    };
    Ok(CertificatePolicy::Validate(Arc::new(pinned)))
}
