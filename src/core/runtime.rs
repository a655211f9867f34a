use crate::audit;
use crate::config::Config;
use crate::domain::{CommandPublisher, DomainHandler, RecordStore, UserDirectory};
use crate::listeners::{BoundPorts, ListenerManager};
use crate::mqtt::{Broker, SessionContext, SessionSettings};
use crate::pki::seal::KeySealer;
use crate::pki::store::FileMaterialStore;
use crate::pki::PkiManager;
use crate::security::{GatewayAuthenticator, NamespaceAuthorizer};
use crate::telemetry::LogHandle;
use crate::time::SharedClock;
use crate::tls::TlsTrust;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Wires PKI, trust, broker, domain handler and listeners together and owns
/// their lifecycle.
pub struct Runtime {
    config: Config,
    clock: SharedClock,
    pki: Arc<PkiManager>,
    trust: Arc<TlsTrust>,
    broker: Arc<Broker>,
    commands: CommandPublisher,
    listeners: ListenerManager,
    material_watch: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl Runtime {
    /// Build the runtime. Spawns the domain record worker, so it must be
    /// called inside a tokio runtime.
    pub fn new(
        config: Config,
        record_store: Arc<dyn RecordStore>,
        directory: Arc<dyn UserDirectory>,
        clock: SharedClock,
        log_handle: Option<LogHandle>,
    ) -> Result<Self> {
        config.validate()?;
        audit::install_sink(audit::AuditSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = Arc::new(FileMaterialStore::new(config.pki.store_path.clone()));
        let sealer = KeySealer::from_secret(config.pki.secret.expose());
        let pki = Arc::new(
            PkiManager::open(store, sealer, clock.clone()).with_context(|| {
                format!("open pki store {}", config.pki.store_path.display())
            })?,
        );
        let trust = Arc::new(TlsTrust::new(
            config.listeners.require_client_certificate,
            &config.listeners.alpn,
        ));
        pki.add_observer(trust.clone());

        let root = config.broker.topic_root.clone();
        let handler = DomainHandler::spawn(record_store, root.clone(), &config.domain, clock.clone());
        let broker = Arc::new(Broker::new(
            Arc::new(NamespaceAuthorizer::new(root.clone())),
            handler,
        ));
        let ctx = Arc::new(SessionContext {
            broker: broker.clone(),
            authenticator: Arc::new(GatewayAuthenticator::new(
                directory,
                config.broker.allow_anonymous,
            )),
            settings: SessionSettings::from(&config.broker),
            clock: clock.clone(),
        });
        let listeners = ListenerManager::new(config.listeners.clone(), ctx, trust.clone());
        let commands = CommandPublisher::new(broker.clone(), root);
        Ok(Self {
            config,
            clock,
            pki,
            trust,
            broker,
            commands,
            listeners,
            material_watch: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    /// Bootstrap PKI if configured, load listener trust and start listening.
    pub async fn start(&self) -> Result<BoundPorts> {
        if self.config.pki.bootstrap {
            self.pki
                .ensure_bootstrap(&self.config.pki)
                .context("bootstrap pki material")?;
        }
        if let Err(err) = self.trust.rebuild(&self.pki) {
            tracing::warn!("TLS trust not loaded yet: {err}");
        }
        self.watch_material();
        let ports = self.listeners.start().await?;
        tracing::info!(
            plain_port = ?ports.plain_port,
            tls_port = ?ports.tls_port,
            ws_port = ?ports.ws_port,
            topic_root = %self.config.broker.topic_root,
            "locus runtime started"
        );
        Ok(ports)
    }

    /// Start, then wait for CTRL+C or a shutdown request and drain.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.handle_shutdown().await
    }

    async fn handle_shutdown(&mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested by component");
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Ask a running `run` loop to drain and return.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Drain listeners and sessions. Established sessions publish their wills.
    pub async fn shutdown(&self) {
        if let Some(task) = self.material_watch.lock().take() {
            task.abort();
        }
        self.listeners.stop().await;
    }

    /// Poll the material store so changes written by `locus pki` reach the
    /// listener without a restart.
    fn watch_material(&self) {
        let Some(every) = self.config.pki.reload_interval() else {
            return;
        };
        let pki = self.pki.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pki = pki.clone();
                match tokio::task::spawn_blocking(move || pki.reload()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => tracing::warn!("pki reload failed: {err}"),
                    Err(err) => tracing::warn!("pki reload task failed: {err}"),
                }
            }
        });
        if let Some(previous) = self.material_watch.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    pub fn pki(&self) -> &Arc<PkiManager> {
        &self.pki
    }

    pub fn trust(&self) -> &Arc<TlsTrust> {
        &self.trust
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn commands(&self) -> &CommandPublisher {
        &self.commands
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.listeners
    }

    pub fn bound_ports(&self) -> BoundPorts {
        self.listeners.bound_ports()
    }

    pub fn log_handle(&self) -> Option<LogHandle> {
        self.log_handle.clone()
    }
}
