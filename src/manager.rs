/// Lifecycle management for the named test servers
///
/// The manager owns the Battery and Master server instances, tracks an
/// explicit status per server and performs the stop-then-start sequence
/// when a configuration change lands on a running server. A failed
/// restart leaves the affected server visibly failed instead of silently
/// reverting; the other server is never touched.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::lookup_host;

use crate::config::{AppConfig, InitialRegisters, ServerConfig};
use crate::error::{TestbedError, TestbedResult};
use crate::server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig};
use crate::store::RegisterStore;

/// The two simulated devices of the test bench
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerName {
    Battery,
    Master,
}

impl ServerName {
    fn other(self) -> ServerName {
        match self {
            ServerName::Battery => ServerName::Master,
            ServerName::Master => ServerName::Battery,
        }
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerName::Battery => "Battery Server",
            ServerName::Master => "Master Server",
        };
        write!(f, "{}", name)
    }
}

/// Runtime state of one managed server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Running,
    /// A start or restart failed; the message is what went wrong
    Failed { message: String },
}

impl ServerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ServerStatus::Running)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "Stopped"),
            ServerStatus::Running => write!(f, "Running"),
            ServerStatus::Failed { message } => write!(f, "Failed: {}", message),
        }
    }
}

struct ManagedServer {
    config: ServerConfig,
    status: ServerStatus,
    instance: Option<ModbusTcpServer>,
}

impl ManagedServer {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status: ServerStatus::Stopped,
            instance: None,
        }
    }
}

/// Owns the Battery and Master servers and their stored configurations
pub struct ServerManager {
    battery: ManagedServer,
    master: ManagedServer,
    initials: InitialRegisters,
    request_timeout: Duration,
}

impl ServerManager {
    /// Create a manager from a loaded application configuration
    ///
    /// Both servers start out stopped; nothing binds until `start`.
    pub fn new(config: AppConfig) -> Self {
        Self {
            battery: ManagedServer::new(config.battery_server),
            master: ManagedServer::new(config.master_server),
            initials: config.initial_registers,
            request_timeout: Duration::from_secs(30),
        }
    }

    fn entry(&self, name: ServerName) -> &ManagedServer {
        match name {
            ServerName::Battery => &self.battery,
            ServerName::Master => &self.master,
        }
    }

    fn entry_mut(&mut self, name: ServerName) -> &mut ManagedServer {
        match name {
            ServerName::Battery => &mut self.battery,
            ServerName::Master => &mut self.master,
        }
    }

    /// Stored configuration for a server
    pub fn config(&self, name: ServerName) -> &ServerConfig {
        &self.entry(name).config
    }

    /// Current status of a server
    pub fn status(&self, name: ServerName) -> ServerStatus {
        self.entry(name).status.clone()
    }

    /// Check whether a server is currently serving
    pub fn is_running(&self, name: ServerName) -> bool {
        self.entry(name).status.is_running()
    }

    /// The register store of a running server
    ///
    /// `None` while stopped; the store is created on start and discarded
    /// on stop.
    pub fn store(&self, name: ServerName) -> Option<Arc<RegisterStore>> {
        self.entry(name)
            .instance
            .as_ref()
            .map(|server| server.get_store())
    }

    /// The bound address of a running server
    pub fn local_addr(&self, name: ServerName) -> Option<SocketAddr> {
        self.entry(name)
            .instance
            .as_ref()
            .and_then(|server| server.local_addr())
    }

    /// Resolve a configured `host:port` into a socket address
    async fn resolve(config: &ServerConfig) -> TestbedResult<SocketAddr> {
        let endpoint = config.endpoint();
        let resolved = lookup_host(&endpoint)
            .await
            .map_err(|e| {
                TestbedError::configuration(format!("Cannot resolve {}: {}", endpoint, e))
            })?
            .next()
            .ok_or_else(|| {
                TestbedError::configuration(format!("No address found for {}", endpoint))
            });
        resolved
    }

    /// Start a server with its stored configuration
    ///
    /// Idempotent while running. On failure the server is flagged
    /// `Failed` and the error is returned.
    pub async fn start(&mut self, name: ServerName) -> TestbedResult<()> {
        if self.entry(name).status.is_running() {
            info!("{} already running", name);
            return Ok(());
        }

        let config = self.entry(name).config.clone();
        let bind_address = match Self::resolve(&config).await {
            Ok(addr) => addr,
            Err(e) => {
                self.entry_mut(name).status = ServerStatus::Failed { message: e.to_string() };
                error!("{} failed to start: {}", name, e);
                return Err(e);
            }
        };

        let store = Arc::new(RegisterStore::new());
        store.seed(&self.initials);

        let mut server = ModbusTcpServer::with_config(ModbusTcpServerConfig {
            bind_address,
            unit_id: config.unit_id,
            store: Some(store),
            request_timeout: self.request_timeout,
            ..Default::default()
        });

        match server.start().await {
            Ok(()) => {
                info!("{} started on {}", name, config.endpoint());
                let entry = self.entry_mut(name);
                entry.instance = Some(server);
                entry.status = ServerStatus::Running;
                Ok(())
            }
            Err(e) => {
                error!("{} failed to start on {}: {}", name, config.endpoint(), e);
                self.entry_mut(name).status = ServerStatus::Failed { message: e.to_string() };
                Err(e)
            }
        }
    }

    /// Stop a server and release its socket; idempotent
    pub async fn stop(&mut self, name: ServerName) -> TestbedResult<()> {
        let entry = self.entry_mut(name);
        if let Some(mut server) = entry.instance.take() {
            server.stop().await?;
            info!("{} stopped", name);
        }
        self.entry_mut(name).status = ServerStatus::Stopped;
        Ok(())
    }

    /// Apply a new configuration to a named server
    ///
    /// A stopped server just takes the new config. A running server is
    /// stopped, then started with the new parameters; when the new start
    /// fails the server stays down, flagged `Failed`, with its old socket
    /// already released. An endpoint colliding with the other server's
    /// configuration is rejected before anything is touched.
    pub async fn apply_config(&mut self, name: ServerName, new_config: ServerConfig) -> TestbedResult<()> {
        new_config.validate()?;

        let other = self.entry(name.other());
        if new_config.endpoint() == other.config.endpoint() {
            return Err(TestbedError::configuration(format!(
                "{} endpoint {} collides with {}",
                name,
                new_config.endpoint(),
                name.other()
            )));
        }

        let was_running = self.entry(name).status.is_running();
        info!(
            "Applying configuration to {}: {} unit {} (currently {})",
            name,
            new_config.endpoint(),
            new_config.unit_id,
            self.entry(name).status
        );

        if was_running {
            self.stop(name).await?;
        }

        self.entry_mut(name).config = new_config;

        if was_running {
            self.start(name).await?;
        }
        Ok(())
    }

    /// Replace the initial register values used by subsequent starts
    pub fn apply_initial_registers(&mut self, initials: InitialRegisters) {
        self.initials = initials;
    }

    /// A snapshot of both stored configurations plus the seed values
    pub fn current_config(&self) -> AppConfig {
        AppConfig {
            battery_server: self.battery.config.clone(),
            master_server: self.master.config.clone(),
            initial_registers: self.initials.clone(),
        }
    }

    /// Stop both servers
    pub async fn stop_all(&mut self) -> TestbedResult<()> {
        self.stop(ServerName::Battery).await?;
        self.stop(ServerName::Master).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        // ephemeral ports so tests never collide with a real deployment
        config.battery_server.port = 0;
        config.master_server.port = 0;
        config
    }

    #[tokio::test]
    async fn test_apply_config_while_stopped_only_updates() {
        let mut manager = ServerManager::new(test_config());

        let new_config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 15020,
            unit_id: 3,
        };
        manager
            .apply_config(ServerName::Battery, new_config.clone())
            .await
            .unwrap();

        assert_eq!(manager.config(ServerName::Battery), &new_config);
        assert_eq!(manager.status(ServerName::Battery), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_rejected() {
        let mut manager = ServerManager::new(test_config());

        let endpoint = ServerConfig {
            host: "127.0.0.1".into(),
            port: 15021,
            unit_id: 1,
        };
        manager
            .apply_config(ServerName::Master, endpoint.clone())
            .await
            .unwrap();

        let result = manager.apply_config(ServerName::Battery, endpoint).await;
        assert!(matches!(result, Err(TestbedError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let mut manager = ServerManager::new(test_config());

        manager.start(ServerName::Battery).await.unwrap();
        assert!(manager.is_running(ServerName::Battery));
        assert!(manager.local_addr(ServerName::Battery).is_some());
        assert!(manager.store(ServerName::Battery).is_some());
        // the other server is independent
        assert!(!manager.is_running(ServerName::Master));

        // idempotent start
        manager.start(ServerName::Battery).await.unwrap();

        manager.stop(ServerName::Battery).await.unwrap();
        assert_eq!(manager.status(ServerName::Battery), ServerStatus::Stopped);
        assert!(manager.store(ServerName::Battery).is_none());

        // idempotent stop
        manager.stop(ServerName::Battery).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_is_flagged() {
        let mut manager = ServerManager::new(test_config());

        // grab a port, then configure the battery server onto it
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap();

        manager
            .apply_config(
                ServerName::Battery,
                ServerConfig {
                    host: "127.0.0.1".into(),
                    port: taken.port(),
                    unit_id: 1,
                },
            )
            .await
            .unwrap();

        let result = manager.start(ServerName::Battery).await;
        assert!(matches!(result, Err(TestbedError::Bind { .. })));
        assert!(matches!(
            manager.status(ServerName::Battery),
            ServerStatus::Failed { .. }
        ));
        assert!(!manager.is_running(ServerName::Battery));
    }
}
