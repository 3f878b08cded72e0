/// Modbus TCP server instance
///
/// One server binds one `host:port`, answers for one configured unit id
/// and serves requests against one register store. The accept loop and
/// every client connection run as tokio tasks wired to a broadcast
/// shutdown channel; `stop()` returns only after the listening socket is
/// released so a following `start()` never races an address still in use.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use log::{debug, error, info, warn};

use crate::error::{TestbedError, TestbedResult};
use crate::protocol::ModbusException;
use crate::store::{RegisterStore, RegisterStoreStats};

/// Maximum frame size for Modbus TCP
const MAX_TCP_FRAME_SIZE: usize = 260;

/// MBAP header size (without unit id)
const MBAP_HEADER_SIZE: usize = 6;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> TestbedResult<()>;

    /// Stop the server and release its socket; idempotent
    async fn stop(&mut self) -> TestbedResult<()>;

    /// Check if the server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;

    /// Get the register store this server serves
    fn get_store(&self) -> Arc<RegisterStore>;
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub store_stats: Option<RegisterStoreStats>,
}

/// Modbus TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    pub unit_id: u8,
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub store: Option<Arc<RegisterStore>>,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:502".parse().unwrap(),
            unit_id: 1,
            max_connections: 100,
            request_timeout: Duration::from_secs(30),
            store: None,
        }
    }
}

/// Modbus TCP server implementation
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    store: Arc<RegisterStore>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    is_running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    /// Create a new TCP server with default configuration
    pub fn new(bind_address: &str) -> TestbedResult<Self> {
        let addr = bind_address
            .parse()
            .map_err(|e| TestbedError::invalid_data(format!("Invalid bind address: {}", e)))?;

        let config = ModbusTcpServerConfig {
            bind_address: addr,
            ..Default::default()
        };

        Ok(Self::with_config(config))
    }

    /// Create a new TCP server with custom configuration
    pub fn with_config(config: ModbusTcpServerConfig) -> Self {
        let store = config
            .store
            .clone()
            .unwrap_or_else(|| Arc::new(RegisterStore::new()));

        Self {
            config,
            store,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            accept_task: None,
            is_running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
        }
    }

    /// The address the listener actually bound (set once running)
    ///
    /// Differs from the configured address when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The unit id this server answers for
    pub fn unit_id(&self) -> u8 {
        self.config.unit_id
    }

    /// Handle one client connection until it closes or shutdown fires
    async fn handle_client(
        stream: TcpStream,
        unit_id: u8,
        store: Arc<RegisterStore>,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        request_timeout: Duration,
    ) {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("Client connected: {}", peer_addr);

        if let Ok(mut stats) = stats.lock() {
            stats.connections_count += 1;
        }

        let mut stream = stream;
        let mut buffer = vec![0u8; MAX_TCP_FRAME_SIZE];

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }

                result = timeout(request_timeout, stream.read(&mut buffer)) => {
                    match result {
                        Ok(Ok(0)) => {
                            debug!("Client {} disconnected", peer_addr);
                            break;
                        }
                        Ok(Ok(bytes_read)) => {
                            if let Ok(mut stats) = stats.lock() {
                                stats.total_requests += 1;
                            }

                            match Self::process_frame(&buffer[..bytes_read], unit_id, &store) {
                                Ok(response) => {
                                    if let Err(e) = stream.write_all(&response).await {
                                        error!("Failed to send response to {}: {}", peer_addr, e);
                                        break;
                                    }
                                    if let Ok(mut stats) = stats.lock() {
                                        stats.successful_requests += 1;
                                    }
                                }
                                Err(e) => {
                                    // Unparseable frame: drop this connection,
                                    // the server itself keeps running.
                                    warn!("Dropping {} after malformed frame: {}", peer_addr, e);
                                    if let Ok(mut stats) = stats.lock() {
                                        stats.failed_requests += 1;
                                    }
                                    break;
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            error!("Read error from {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            debug!("Read timeout from {}", peer_addr);
                            break;
                        }
                    }
                }
            }
        }

        info!("Client {} disconnected", peer_addr);
    }

    /// Process one MBAP frame into a response frame
    ///
    /// Frame-level failures (short frame, bad protocol id) come back as
    /// errors and cost the client its connection. Request-level failures
    /// (bad span, bad value, wrong unit id) become Modbus exception
    /// responses.
    fn process_frame(frame: &[u8], unit_id: u8, store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if frame.len() < MBAP_HEADER_SIZE + 2 {
            return Err(TestbedError::frame("Frame too short"));
        }

        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        let length = u16::from_be_bytes([frame[4], frame[5]]);
        let request_unit = frame[6];
        let function_code = frame[7];

        if protocol_id != 0 {
            return Err(TestbedError::frame("Invalid protocol ID"));
        }

        if length < 2 || frame.len() < MBAP_HEADER_SIZE + length as usize {
            return Err(TestbedError::frame("Incomplete frame"));
        }

        debug!(
            "Processing request: TID={}, Function=0x{:02X}, Unit={}",
            transaction_id, function_code, request_unit
        );

        // A request for some other unit gets the gateway exception, the
        // way a datastore keyed by a single unit id reports it.
        if request_unit != unit_id {
            debug!(
                "Unit id mismatch: request={}, configured={}",
                request_unit, unit_id
            );
            return Ok(Self::exception_frame(
                transaction_id,
                request_unit,
                function_code,
                ModbusException::GatewayTargetDeviceFailedToRespond.to_u8(),
            ));
        }

        let data = &frame[MBAP_HEADER_SIZE + 2..MBAP_HEADER_SIZE + length as usize];

        let result = match function_code {
            0x01 => Self::handle_read_coils(data, store),
            0x02 => Self::handle_read_discrete_inputs(data, store),
            0x03 => Self::handle_read_holding_registers(data, store),
            0x04 => Self::handle_read_input_registers(data, store),
            0x05 => Self::handle_write_single_coil(data, store),
            0x06 => Self::handle_write_single_register(data, store),
            0x0F => Self::handle_write_multiple_coils(data, store),
            0x10 => Self::handle_write_multiple_registers(data, store),
            _ => Err(TestbedError::invalid_function(function_code)),
        };

        match result {
            Ok(response_data) => {
                let response_length = response_data.len() + 2;
                let mut response = Vec::with_capacity(MBAP_HEADER_SIZE + response_length);

                response.extend_from_slice(&transaction_id.to_be_bytes());
                response.extend_from_slice(&protocol_id.to_be_bytes());
                response.extend_from_slice(&(response_length as u16).to_be_bytes());
                response.push(request_unit);
                response.push(function_code);
                response.extend_from_slice(&response_data);

                Ok(response)
            }
            // Frame-structure problems inside the PDU still drop the
            // connection; everything else maps to an exception response.
            Err(e @ TestbedError::Frame { .. }) => Err(e),
            Err(e) => {
                debug!("Request failed, answering with exception: {}", e);
                Ok(Self::exception_frame(
                    transaction_id,
                    request_unit,
                    function_code,
                    Self::exception_code_for(&e),
                ))
            }
        }
    }

    /// Map a store/dispatch error onto a Modbus exception code
    fn exception_code_for(error: &TestbedError) -> u8 {
        match error {
            TestbedError::OutOfRange { .. } => ModbusException::IllegalDataAddress.to_u8(),
            TestbedError::InvalidData { .. } => ModbusException::IllegalDataValue.to_u8(),
            TestbedError::InvalidFunction { .. } => ModbusException::IllegalFunction.to_u8(),
            _ => ModbusException::ServerDeviceFailure.to_u8(),
        }
    }

    /// Build a complete exception response frame
    fn exception_frame(transaction_id: u16, unit_id: u8, function_code: u8, exception_code: u8) -> Vec<u8> {
        let mut response = Vec::with_capacity(MBAP_HEADER_SIZE + 3);

        response.extend_from_slice(&transaction_id.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&3u16.to_be_bytes());
        response.push(unit_id);
        response.push(function_code | 0x80);
        response.push(exception_code);

        response
    }

    /// Handle read coils (0x01)
    fn handle_read_coils(data: &[u8], store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if data.len() < 4 {
            return Err(TestbedError::frame("Invalid read coils request"));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);

        if quantity == 0 || quantity > crate::MAX_COILS_PER_REQUEST {
            return Err(TestbedError::invalid_data("Invalid quantity"));
        }

        let coils = store.read_coils(address, quantity)?;
        Ok(Self::bits_response(&coils))
    }

    /// Handle read discrete inputs (0x02)
    fn handle_read_discrete_inputs(data: &[u8], store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if data.len() < 4 {
            return Err(TestbedError::frame("Invalid read discrete inputs request"));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);

        if quantity == 0 || quantity > crate::MAX_COILS_PER_REQUEST {
            return Err(TestbedError::invalid_data("Invalid quantity"));
        }

        let inputs = store.read_discrete_inputs(address, quantity)?;
        Ok(Self::bits_response(&inputs))
    }

    /// Pack a bit read result into byte_count + packed bytes
    fn bits_response(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut response = vec![byte_count as u8];

        for i in 0..byte_count {
            let mut byte_value = 0u8;
            for bit in 0..8 {
                let index = i * 8 + bit;
                if index < bits.len() && bits[index] {
                    byte_value |= 1 << bit;
                }
            }
            response.push(byte_value);
        }

        response
    }

    /// Handle read holding registers (0x03)
    fn handle_read_holding_registers(data: &[u8], store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if data.len() < 4 {
            return Err(TestbedError::frame("Invalid read holding registers request"));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);

        if quantity == 0 || quantity > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(TestbedError::invalid_data("Invalid quantity"));
        }

        let registers = store.read_holding_registers(address, quantity)?;
        Ok(Self::registers_response(&registers))
    }

    /// Handle read input registers (0x04)
    fn handle_read_input_registers(data: &[u8], store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if data.len() < 4 {
            return Err(TestbedError::frame("Invalid read input registers request"));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);

        if quantity == 0 || quantity > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(TestbedError::invalid_data("Invalid quantity"));
        }

        let registers = store.read_input_registers(address, quantity)?;
        Ok(Self::registers_response(&registers))
    }

    /// Pack a register read result into byte_count + big-endian words
    fn registers_response(registers: &[u16]) -> Vec<u8> {
        let mut response = vec![(registers.len() * 2) as u8];
        for register in registers {
            response.extend_from_slice(&register.to_be_bytes());
        }
        response
    }

    /// Handle write single coil (0x05)
    fn handle_write_single_coil(data: &[u8], store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if data.len() < 4 {
            return Err(TestbedError::frame("Invalid write single coil request"));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);

        let coil_value = match value {
            0x0000 => false,
            0xFF00 => true,
            _ => return Err(TestbedError::invalid_data("Invalid coil value")),
        };

        store.write_single_coil(address, coil_value)?;

        // Echo back the request
        Ok(data[0..4].to_vec())
    }

    /// Handle write single register (0x06)
    fn handle_write_single_register(data: &[u8], store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if data.len() < 4 {
            return Err(TestbedError::frame("Invalid write single register request"));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);

        store.write_single_register(address, value)?;

        // Echo back the request
        Ok(data[0..4].to_vec())
    }

    /// Handle write multiple coils (0x0F)
    fn handle_write_multiple_coils(data: &[u8], store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if data.len() < 5 {
            return Err(TestbedError::frame("Invalid write multiple coils request"));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        let byte_count = data[4] as usize;

        if quantity == 0 || quantity > crate::MAX_COILS_PER_REQUEST {
            return Err(TestbedError::invalid_data("Invalid quantity"));
        }
        if data.len() < 5 + byte_count || byte_count != (quantity as usize + 7) / 8 {
            return Err(TestbedError::frame("Incomplete write multiple coils request"));
        }

        let mut coils = Vec::with_capacity(quantity as usize);
        for i in 0..quantity {
            let byte_index = (i / 8) as usize;
            let bit_index = i % 8;
            let byte_value = data[5 + byte_index];
            coils.push((byte_value & (1 << bit_index)) != 0);
        }

        store.write_coils(address, &coils)?;

        // Return address and quantity
        Ok(data[0..4].to_vec())
    }

    /// Handle write multiple registers (0x10)
    fn handle_write_multiple_registers(data: &[u8], store: &Arc<RegisterStore>) -> TestbedResult<Vec<u8>> {
        if data.len() < 5 {
            return Err(TestbedError::frame("Invalid write multiple registers request"));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        let byte_count = data[4] as usize;

        if quantity == 0 || quantity > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(TestbedError::invalid_data("Invalid quantity"));
        }
        if data.len() < 5 + byte_count || byte_count != (quantity as usize * 2) {
            return Err(TestbedError::frame("Incomplete write multiple registers request"));
        }

        let mut registers = Vec::with_capacity(quantity as usize);
        for i in 0..quantity {
            let offset = 5 + (i as usize * 2);
            registers.push(u16::from_be_bytes([data[offset], data[offset + 1]]));
        }

        store.write_registers(address, &registers)?;

        // Return address and quantity
        Ok(data[0..4].to_vec())
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> TestbedResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(TestbedError::protocol("Server is already running"));
        }

        info!("Starting Modbus TCP server on {}", self.config.bind_address);

        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            TestbedError::bind(self.config.bind_address.to_string(), e.to_string())
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            TestbedError::bind(self.config.bind_address.to_string(), e.to_string())
        })?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.is_running.store(true, Ordering::SeqCst);

        info!(
            "Modbus TCP server listening on {} (unit {}, max {} connections, request timeout {:?})",
            local_addr, self.config.unit_id, self.config.max_connections, self.config.request_timeout
        );

        let unit_id = self.config.unit_id;
        let store = self.store.clone();
        let stats = self.stats.clone();
        let request_timeout = self.config.request_timeout;
        let is_running = self.is_running.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("Accepted connection from {}", addr);

                                let store = store.clone();
                                let stats = stats.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_client(
                                        stream,
                                        unit_id,
                                        store,
                                        stats,
                                        shutdown_rx,
                                        request_timeout,
                                    )
                                    .await;
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Shutdown signal received, closing listener");
                        break;
                    }
                }
            }

            // Listener drops here; the port is free again.
            is_running.store(false, Ordering::SeqCst);
        });
        self.accept_task = Some(accept_task);

        Ok(())
    }

    async fn stop(&mut self) -> TestbedResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        // Wait for the accept loop to drop the listener before reporting
        // stopped; a restart may rebind the same port immediately after.
        if let Some(handle) = self.accept_task.take() {
            let _ = handle.await;
        }

        self.is_running.store(false, Ordering::SeqCst);
        self.local_addr = None;

        info!("Modbus TCP server on {} stopped", self.config.bind_address);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.store_stats = Some(self.store.get_stats());
        stats
    }

    fn get_store(&self) -> Arc<RegisterStore> {
        self.store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_request(transaction_id: u16, unit: u8, function: u8, address: u16, quantity: u16) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&6u16.to_be_bytes());
        frame.push(unit);
        frame.push(function);
        frame.extend_from_slice(&address.to_be_bytes());
        frame.extend_from_slice(&quantity.to_be_bytes());
        frame
    }

    #[test]
    fn test_process_read_holding_registers() {
        let store = Arc::new(RegisterStore::new());
        store.write_registers(0, &[0x1234, 0x5678]).unwrap();

        let frame = read_request(7, 1, 0x03, 0, 2);
        let response = ModbusTcpServer::process_frame(&frame, 1, &store).unwrap();

        // MBAP echo
        assert_eq!(u16::from_be_bytes([response[0], response[1]]), 7);
        assert_eq!(response[6], 1);
        assert_eq!(response[7], 0x03);
        // byte count + values
        assert_eq!(response[8], 4);
        assert_eq!(u16::from_be_bytes([response[9], response[10]]), 0x1234);
        assert_eq!(u16::from_be_bytes([response[11], response[12]]), 0x5678);
    }

    #[test]
    fn test_unit_id_mismatch_yields_gateway_exception() {
        let store = Arc::new(RegisterStore::new());

        let frame = read_request(1, 9, 0x03, 0, 1);
        let response = ModbusTcpServer::process_frame(&frame, 1, &store).unwrap();

        assert_eq!(response[7], 0x03 | 0x80);
        assert_eq!(response[8], 0x0B);
    }

    #[test]
    fn test_out_of_range_yields_illegal_data_address() {
        let store = Arc::new(RegisterStore::with_capacity(10));

        let frame = read_request(1, 1, 0x03, 9, 2);
        let response = ModbusTcpServer::process_frame(&frame, 1, &store).unwrap();

        assert_eq!(response[7], 0x03 | 0x80);
        assert_eq!(response[8], 0x02);
    }

    #[test]
    fn test_unknown_function_yields_illegal_function() {
        let store = Arc::new(RegisterStore::new());

        let frame = read_request(1, 1, 0x2B, 0, 1);
        let response = ModbusTcpServer::process_frame(&frame, 1, &store).unwrap();

        assert_eq!(response[7], 0x2B | 0x80);
        assert_eq!(response[8], 0x01);
    }

    #[test]
    fn test_short_frame_is_a_frame_error() {
        let store = Arc::new(RegisterStore::new());
        let result = ModbusTcpServer::process_frame(&[0x00, 0x01, 0x00], 1, &store);
        assert!(matches!(result, Err(TestbedError::Frame { .. })));
    }

    #[test]
    fn test_write_single_coil_roundtrip() {
        let store = Arc::new(RegisterStore::new());

        let mut frame = Vec::new();
        frame.extend_from_slice(&3u16.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&6u16.to_be_bytes());
        frame.push(1);
        frame.push(0x05);
        frame.extend_from_slice(&4u16.to_be_bytes());
        frame.extend_from_slice(&0xFF00u16.to_be_bytes());

        let response = ModbusTcpServer::process_frame(&frame, 1, &store).unwrap();
        assert_eq!(response[7], 0x05);
        assert_eq!(store.read_coils(4, 1).unwrap(), vec![true]);
    }
}
