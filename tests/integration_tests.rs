//! Integration Tests for the Modbus Testbed
//!
//! End-to-end scenarios over localhost: real sockets, real MBAP frames,
//! configuration files on disk, and the manager's restart sequencing.

use std::sync::Arc;
use std::time::Duration;

use modbus_testbed::{
    panel, AppConfig, ConfigStore, ModbusServer, ModbusTcpClient, ModbusTcpServer,
    ModbusTcpServerConfig, RegisterKind, RegisterStore, RegisterValue, ServerConfig,
    ServerManager, ServerName, ServerStatus, TestbedError,
};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Grab a free localhost port from the OS
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a standalone server on an ephemeral port with a seeded store
async fn start_seeded_server(unit_id: u8) -> (ModbusTcpServer, std::net::SocketAddr) {
    let store = Arc::new(RegisterStore::new());
    store.seed(&AppConfig::default().initial_registers);

    let mut server = ModbusTcpServer::with_config(ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        unit_id,
        store: Some(store),
        ..Default::default()
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

#[tokio::test]
async fn test_read_write_round_trip_over_tcp() {
    let (mut server, addr) = start_seeded_server(1).await;
    let mut client = ModbusTcpClient::new(addr, CLIENT_TIMEOUT).await.unwrap();

    // Seeded defaults: holding 40001=1, 40002=0, 40010=1234
    let seeded = client.read_holding_registers(1, 0, 2).await.unwrap();
    assert_eq!(seeded, vec![1, 0]);
    let seeded = client.read_holding_registers(1, 9, 1).await.unwrap();
    assert_eq!(seeded, vec![1234]);

    // input 30001=3700, 30002=251
    let inputs = client.read_input_registers(1, 0, 2).await.unwrap();
    assert_eq!(inputs, vec![3700, 251]);

    // coils 00001=1, 00002=0 / discrete 10001=1, 10002=0
    assert_eq!(client.read_coils(1, 0, 2).await.unwrap(), vec![true, false]);
    assert_eq!(
        client.read_discrete_inputs(1, 0, 2).await.unwrap(),
        vec![true, false]
    );

    // Write then read returns exactly the written values
    client
        .write_multiple_registers(1, 100, &[0x1111, 0x2222, 0x3333])
        .await
        .unwrap();
    assert_eq!(
        client.read_holding_registers(1, 100, 3).await.unwrap(),
        vec![0x1111, 0x2222, 0x3333]
    );

    client.write_single_register(1, 200, 777).await.unwrap();
    assert_eq!(client.read_holding_registers(1, 200, 1).await.unwrap(), vec![777]);

    client
        .write_multiple_coils(1, 50, &[true, false, true, true])
        .await
        .unwrap();
    assert_eq!(
        client.read_coils(1, 50, 4).await.unwrap(),
        vec![true, false, true, true]
    );

    client.write_single_coil(1, 60, true).await.unwrap();
    assert_eq!(client.read_coils(1, 60, 1).await.unwrap(), vec![true]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unit_id_mismatch_is_rejected() {
    let (mut server, addr) = start_seeded_server(7).await;
    let mut client = ModbusTcpClient::new(addr, CLIENT_TIMEOUT).await.unwrap();

    // Matching unit id answers with data
    assert_eq!(client.read_holding_registers(7, 0, 1).await.unwrap(), vec![1]);

    // Mismatched unit id gets the gateway exception
    let result = client.read_holding_registers(8, 0, 1).await;
    assert!(matches!(
        result,
        Err(TestbedError::Exception { code: 0x0B, .. })
    ));

    // The connection survives the exception
    assert_eq!(client.read_holding_registers(7, 0, 1).await.unwrap(), vec![1]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_request_gets_illegal_data_address() {
    let (mut server, addr) = start_seeded_server(1).await;
    let mut client = ModbusTcpClient::new(addr, CLIENT_TIMEOUT).await.unwrap();

    // capacity is 10_000 per kind
    let result = client.read_holding_registers(1, 9999, 2).await;
    assert!(matches!(
        result,
        Err(TestbedError::Exception { code: 0x02, .. })
    ));

    let result = client.write_multiple_registers(1, 9999, &[1, 2]).await;
    assert!(matches!(
        result,
        Err(TestbedError::Exception { code: 0x02, .. })
    ));

    // nothing partially applied at the edge
    assert_eq!(client.read_holding_registers(1, 9998, 2).await.unwrap(), vec![0, 0]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_resets_in_flight_connections() {
    let (mut server, addr) = start_seeded_server(1).await;
    let mut client = ModbusTcpClient::new(addr, CLIENT_TIMEOUT).await.unwrap();

    assert_eq!(client.read_holding_registers(1, 0, 1).await.unwrap(), vec![1]);

    server.stop().await.unwrap();
    assert!(!server.is_running());

    // The open connection is cut; the next request fails instead of hanging
    let result = client.read_holding_registers(1, 0, 1).await;
    assert!(result.is_err());

    // New connections are refused once the socket is released
    let reconnect = ModbusTcpClient::new(addr, CLIENT_TIMEOUT).await;
    assert!(reconnect.is_err());

    // stop is idempotent
    server.stop().await.unwrap();
}

fn manager_config(battery_port: u16, master_port: u16) -> AppConfig {
    let mut config = AppConfig::default();
    config.battery_server.port = battery_port;
    config.master_server.port = master_port;
    config
}

#[tokio::test]
async fn test_apply_config_restarts_running_server_on_new_endpoint() {
    let old_port = free_port();
    let new_port = free_port();
    let master_port = free_port();

    let mut manager = ServerManager::new(manager_config(old_port, master_port));
    manager.start(ServerName::Battery).await.unwrap();
    manager.start(ServerName::Master).await.unwrap();

    // reachable at the old endpoint
    let mut client = ModbusTcpClient::from_address(&format!("127.0.0.1:{}", old_port), CLIENT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(client.read_holding_registers(1, 0, 1).await.unwrap(), vec![1]);
    client.close().await.unwrap();

    manager
        .apply_config(
            ServerName::Battery,
            ServerConfig {
                host: "127.0.0.1".into(),
                port: new_port,
                unit_id: 1,
            },
        )
        .await
        .unwrap();

    assert!(manager.is_running(ServerName::Battery));
    assert_eq!(manager.local_addr(ServerName::Battery).unwrap().port(), new_port);

    // old endpoint refuses connections
    assert!(
        ModbusTcpClient::from_address(&format!("127.0.0.1:{}", old_port), CLIENT_TIMEOUT)
            .await
            .is_err()
    );

    // new endpoint serves valid Modbus responses
    let mut client = ModbusTcpClient::from_address(&format!("127.0.0.1:{}", new_port), CLIENT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(client.read_holding_registers(1, 0, 1).await.unwrap(), vec![1]);
    client.close().await.unwrap();

    // the other server never flinched
    assert!(manager.is_running(ServerName::Master));

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_failed_restart_leaves_server_down_and_other_untouched() {
    let battery_port = free_port();
    let master_port = free_port();

    let mut manager = ServerManager::new(manager_config(battery_port, master_port));
    manager.start(ServerName::Battery).await.unwrap();
    manager.start(ServerName::Master).await.unwrap();

    // Occupy a port so the restart's bind must fail
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let blocked_port = blocker.local_addr().unwrap().port();

    let result = manager
        .apply_config(
            ServerName::Battery,
            ServerConfig {
                host: "127.0.0.1".into(),
                port: blocked_port,
                unit_id: 1,
            },
        )
        .await;

    assert!(matches!(result, Err(TestbedError::Bind { .. })));
    assert!(matches!(
        manager.status(ServerName::Battery),
        ServerStatus::Failed { .. }
    ));
    assert!(!manager.is_running(ServerName::Battery));

    // The old socket was released, not leaked: the old port is bindable again
    drop(tokio::net::TcpListener::bind(("127.0.0.1", battery_port)).await.unwrap());

    // The master server is unaffected and still serving
    assert!(manager.is_running(ServerName::Master));
    let mut client =
        ModbusTcpClient::from_address(&format!("127.0.0.1:{}", master_port), CLIENT_TIMEOUT)
            .await
            .unwrap();
    assert_eq!(client.read_holding_registers(1, 0, 1).await.unwrap(), vec![1]);
    client.close().await.unwrap();

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_config_file_drives_manager_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("config.json"));

    // First load creates the documented defaults on disk
    let mut config = store.load().unwrap();
    assert_eq!(config, AppConfig::default());

    // Move both servers to free ports and persist, as the dialog would
    config.battery_server.port = free_port();
    config.master_server.port = free_port();
    store.save(&config).unwrap();

    let reloaded = store.load().unwrap();
    let battery_endpoint = reloaded.battery_server.endpoint();
    let battery_unit = reloaded.battery_server.unit_id;

    let mut manager = ServerManager::new(reloaded);
    manager.start(ServerName::Battery).await.unwrap();

    let mut client = ModbusTcpClient::from_address(&battery_endpoint, CLIENT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(
        client.read_holding_registers(battery_unit, 9, 1).await.unwrap(),
        vec![1234]
    );
    client.close().await.unwrap();

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_panel_operations_use_human_addressing() {
    let port = free_port();
    let mut manager = ServerManager::new(manager_config(port, free_port()));
    manager.start(ServerName::Battery).await.unwrap();

    let target = manager.config(ServerName::Battery).clone();

    // Seeded default at human address 40010
    let values = panel::read_registers(&target, RegisterKind::Holding, 40010, 1)
        .await
        .unwrap();
    assert_eq!(values, vec![RegisterValue::Word(1234)]);

    // Form input round trip
    let input = panel::parse_values(RegisterKind::Holding, "11, 22, 0x2A").unwrap();
    panel::write_values(&target, RegisterKind::Holding, 40100, &input)
        .await
        .unwrap();
    let readback = panel::read_registers(&target, RegisterKind::Holding, 40100, 3)
        .await
        .unwrap();
    assert_eq!(panel::format_values(&readback), "11, 22, 42");

    // Read-only kinds reject panel writes before touching the network
    let result = panel::write_values(
        &target,
        RegisterKind::Input,
        30001,
        &[RegisterValue::Word(1)],
    )
    .await;
    assert!(matches!(result, Err(TestbedError::InvalidData { .. })));

    // Below-base addresses are rejected
    let result = panel::read_registers(&target, RegisterKind::Holding, 100, 1).await;
    assert!(matches!(result, Err(TestbedError::InvalidData { .. })));

    manager.stop_all().await.unwrap();
}
