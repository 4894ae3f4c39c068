//! Simulator lifecycle: binding the services, spawning the background
//! workers and running the Modbus server until it fails or Ctrl+C.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::{BridgeState, MqttBridge, ReconnectHandle};
use crate::config::SimulatorConfig;
use crate::identity::IdentityResponder;
use crate::registers::RegisterBank;
use crate::server::ModbusServer;
use crate::session::MqttConnector;
use crate::store::ConfigStore;
use crate::web::WebServer;

/// Tracks background workers and aborts them on shutdown.
pub struct WorkerSet {
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Spawn a worker task.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name.into(), tokio::spawn(future)));
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged automatically.
    pub fn spawn_with_error<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let worker = name.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                error!(worker = %worker, error = %e, "Worker failed");
            }
        });
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort every worker.
    pub fn abort_all(&self) {
        for (name, task) in &self.tasks {
            task.abort();
            tracing::debug!(worker = %name, "Worker aborted");
        }
    }
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// All simulator services, bound and ready to run.
pub struct Simulator {
    bank: Arc<RegisterBank>,
    modbus: ModbusServer,
    identity: Option<IdentityResponder>,
    web: Option<WebServer>,
    bridge: MqttBridge<MqttConnector>,
    reconnect: ReconnectHandle,
}

impl Simulator {
    /// Create the register bank and bind every service.
    ///
    /// Failing to bind the Modbus port is an error. The identity responder
    /// and the web form are optional: a bind failure is logged and the
    /// simulator runs without them.
    pub async fn bind(config: &SimulatorConfig) -> anyhow::Result<Self> {
        let bank = Arc::new(RegisterBank::new());
        let store = ConfigStore::new(&config.store.path);

        let modbus = match ModbusServer::bind(&config.modbus.listen, bank.clone()).await {
            Ok(modbus) => modbus,
            Err(e) => {
                error!(addr = %config.modbus.listen, error = %e, "Failed to bind Modbus server");
                return Err(e).with_context(|| {
                    format!("Failed to bind Modbus server to {}", config.modbus.listen)
                });
            }
        };

        let (bridge, reconnect) = MqttBridge::new(
            MqttConnector::new(config.bridge.connect_timeout()),
            Arc::new(store.clone()),
            bank.clone(),
            config.bridge.options(),
        );

        let identity = match IdentityResponder::bind(&config.identity.listen).await {
            Ok(identity) => Some(identity),
            Err(e) => {
                error!(addr = %config.identity.listen, error = %e, "Identity responder disabled");
                None
            }
        };

        let web = match WebServer::bind(&config.web.listen, store.clone(), reconnect.clone()).await
        {
            Ok(web) => Some(web),
            Err(e) => {
                error!(addr = %config.web.listen, error = %e, "Configuration web server disabled");
                None
            }
        };

        info!(
            store = %store.path().display(),
            "Device configuration document"
        );

        Ok(Self {
            bank,
            modbus,
            identity,
            web,
            bridge,
            reconnect,
        })
    }

    /// The shared register bank.
    pub fn bank(&self) -> Arc<RegisterBank> {
        self.bank.clone()
    }

    /// Handle for making the bridge reconnect.
    pub fn reconnect_handle(&self) -> ReconnectHandle {
        self.reconnect.clone()
    }

    /// Bridge state updates.
    pub fn bridge_state(&self) -> tokio::sync::watch::Receiver<BridgeState> {
        self.bridge.state()
    }

    pub fn modbus_addr(&self) -> io::Result<SocketAddr> {
        self.modbus.local_addr()
    }

    pub fn identity_addr(&self) -> Option<SocketAddr> {
        self.identity.as_ref().and_then(|i| i.local_addr().ok())
    }

    pub fn web_addr(&self) -> Option<SocketAddr> {
        self.web.as_ref().and_then(|w| w.local_addr().ok())
    }

    /// Run until the Modbus server stops or Ctrl+C is received.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until the Modbus server stops or `shutdown` completes.
    ///
    /// Returns an error only if the Modbus server fails.
    pub async fn run_until<S>(self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()>,
    {
        let mut workers = WorkerSet::new();

        workers.spawn("mqtt-bridge", self.bridge.run());
        if let Some(identity) = self.identity {
            workers.spawn_with_error("identity", identity.run());
        }
        if let Some(web) = self.web {
            workers.spawn_with_error("web", web.run());
        }

        info!(workers = workers.len(), "Simulator running. Press Ctrl+C to stop.");

        let result = tokio::select! {
            result = self.modbus.serve() => {
                let result = result.context("Modbus server stopped");
                if let Err(e) = &result {
                    error!(error = %e, "Modbus server failed");
                } else {
                    warn!("Modbus server stopped");
                }
                result
            }
            _ = shutdown => {
                info!("Received shutdown signal");
                Ok(())
            }
        };

        workers.abort_all();
        info!("Simulator stopped");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Log sink for asserting on emitted events.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_modbus_bind_failure_is_logged() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = SimulatorConfig::default();
        config.modbus.listen = occupied.local_addr().unwrap().to_string();
        config.identity.listen = "127.0.0.1:0".to_string();
        config.web.listen = "127.0.0.1:0".to_string();
        config.store.path = dir.path().join("device.json");

        let err = Simulator::bind(&config).await.err().unwrap();
        assert!(format!("{:#}", err).contains(&config.modbus.listen));

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("ERROR"));
        assert!(output.contains("Failed to bind Modbus server"));
        assert!(output.contains(&config.modbus.listen));
    }

    #[tokio::test]
    async fn test_worker_errors_are_contained() {
        let mut workers = WorkerSet::new();
        assert!(workers.is_empty());

        let (tx, rx) = tokio::sync::oneshot::channel();
        workers.spawn_with_error("failing", async move {
            let _ = tx.send(());
            Err::<(), _>("boom")
        });
        rx.await.unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        workers.spawn("endless", async move {
            std::future::pending::<()>().await;
            flag.store(true, Ordering::SeqCst);
        });

        assert_eq!(workers.len(), 2);
        workers.abort_all();
        tokio::task::yield_now().await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
