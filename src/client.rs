/// Modbus TCP client
///
/// The counterpart of the test servers: connects to a `host:port`, frames
/// requests with MBAP headers and sequenced transaction ids, and decodes
/// responses including exception frames. Used by the panel operations, the
/// demo binaries and the integration tests; any third-party Modbus client
/// should see the same behavior.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use log::debug;

use crate::error::{TestbedError, TestbedResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, UnitId, data_utils};

/// Maximum frame size for Modbus TCP
const MAX_TCP_FRAME_SIZE: usize = 260;

/// MBAP header size (without unit id)
const MBAP_HEADER_SIZE: usize = 6;

/// Modbus TCP client with a single connection
pub struct ModbusTcpClient {
    stream: Option<TcpStream>,
    address: SocketAddr,
    timeout: Duration,
    transaction_id: u16,
}

impl ModbusTcpClient {
    /// Connect to a server at the given socket address
    pub async fn new(address: SocketAddr, timeout: Duration) -> TestbedResult<Self> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            TestbedError::connection(format!("Failed to connect to {}: {}", address, e))
        })?;

        Ok(Self {
            stream: Some(stream),
            address,
            timeout,
            transaction_id: 0,
        })
    }

    /// Connect to a server given as `host:port`
    pub async fn from_address(address: &str, connect_timeout: Duration) -> TestbedResult<Self> {
        let addr = lookup_host(address)
            .await
            .map_err(|e| TestbedError::connection(format!("Cannot resolve {}: {}", address, e)))?
            .next()
            .ok_or_else(|| {
                TestbedError::connection(format!("No address found for {}", address))
            })?;
        Self::new(addr, connect_timeout).await
    }

    /// The server address this client talks to
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Check if the client believes it is connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection
    pub async fn close(&mut self) -> TestbedResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Encode a request into an MBAP frame
    fn encode_request(&mut self, request: &ModbusRequest) -> Vec<u8> {
        let transaction_id = self.next_transaction_id();

        // unit_id + function_code + function-specific payload
        let pdu_length = 1 + 1 + match request.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteSingleRegister => 4,
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                5 + request.data.len()
            }
        };

        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu_length);

        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&(pdu_length as u16).to_be_bytes());
        frame.push(request.unit_id);
        frame.push(request.function.to_u8());
        frame.extend_from_slice(&request.address.to_be_bytes());

        match request.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                frame.extend_from_slice(&request.quantity.to_be_bytes());
            }
            ModbusFunction::WriteSingleCoil => {
                let value: u16 = if !request.data.is_empty() && request.data[0] != 0 {
                    0xFF00
                } else {
                    0x0000
                };
                frame.extend_from_slice(&value.to_be_bytes());
            }
            ModbusFunction::WriteSingleRegister => {
                if request.data.len() >= 2 {
                    frame.extend_from_slice(&request.data[0..2]);
                } else {
                    frame.extend_from_slice(&[0, 0]);
                }
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                frame.extend_from_slice(&request.quantity.to_be_bytes());
                frame.push(request.data.len() as u8);
                frame.extend_from_slice(&request.data);
            }
        }

        frame
    }

    /// Decode a response frame
    fn decode_response(&self, frame: &[u8]) -> TestbedResult<ModbusResponse> {
        if frame.len() < MBAP_HEADER_SIZE + 2 {
            return Err(TestbedError::frame("Frame too short"));
        }

        let length = u16::from_be_bytes([frame[4], frame[5]]);
        let unit_id = frame[6];
        let function_code = frame[7];

        if frame.len() < MBAP_HEADER_SIZE + length as usize {
            return Err(TestbedError::frame("Incomplete frame"));
        }

        if function_code & 0x80 != 0 {
            if frame.len() < MBAP_HEADER_SIZE + 3 {
                return Err(TestbedError::frame("Invalid exception response"));
            }

            let original_function = function_code & 0x7F;
            let exception_code = frame[8];

            return Ok(ModbusResponse::new_exception(
                unit_id,
                ModbusFunction::from_u8(original_function)?,
                exception_code,
            ));
        }

        let function = ModbusFunction::from_u8(function_code)?;
        let data = frame[MBAP_HEADER_SIZE + 2..MBAP_HEADER_SIZE + length as usize].to_vec();

        Ok(ModbusResponse::new_success(unit_id, function, data))
    }

    /// Execute one request/response cycle
    pub async fn execute(&mut self, request: &ModbusRequest) -> TestbedResult<ModbusResponse> {
        request.validate()?;

        let frame = self.encode_request(request);
        debug!(
            "Sending {} to unit {} @ {}",
            request.function, request.unit_id, self.address
        );

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TestbedError::connection("Client is closed"))?;

        let timeout_ms = self.timeout.as_millis() as u64;
        if timeout(self.timeout, stream.write_all(&frame)).await.is_err() {
            self.stream = None;
            return Err(TestbedError::timeout("send request", timeout_ms));
        }

        // Header plus function code first, then whatever the length field says.
        let mut header_buf = [0u8; MBAP_HEADER_SIZE + 1];
        match timeout(self.timeout, stream.read_exact(&mut header_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.stream = None;
                return Err(TestbedError::connection(format!("Read failed: {}", e)));
            }
            Err(_) => {
                self.stream = None;
                return Err(TestbedError::timeout("read response header", timeout_ms));
            }
        }

        let length = u16::from_be_bytes([header_buf[4], header_buf[5]]);
        if length as usize > MAX_TCP_FRAME_SIZE {
            return Err(TestbedError::frame("Response frame too large"));
        }

        let remaining = (length as usize).saturating_sub(1);
        let mut response_buf = vec![0u8; MBAP_HEADER_SIZE + 1 + remaining];
        response_buf[..MBAP_HEADER_SIZE + 1].copy_from_slice(&header_buf);

        if remaining > 0 {
            match timeout(
                self.timeout,
                stream.read_exact(&mut response_buf[MBAP_HEADER_SIZE + 1..]),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.stream = None;
                    return Err(TestbedError::connection(format!("Read failed: {}", e)));
                }
                Err(_) => {
                    self.stream = None;
                    return Err(TestbedError::timeout("read response data", timeout_ms));
                }
            }
        }

        let response = self.decode_response(&response_buf)?;

        if let Some(error) = response.get_exception() {
            return Err(error);
        }

        Ok(response)
    }

    /// Read coils (function code 0x01)
    pub async fn read_coils(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> TestbedResult<Vec<bool>> {
        let request = ModbusRequest::new_read(unit_id, ModbusFunction::ReadCoils, address, quantity);
        let response = self.execute(&request).await?;
        let mut bits = response.parse_bits()?;
        bits.truncate(quantity as usize);
        Ok(bits)
    }

    /// Read discrete inputs (function code 0x02)
    pub async fn read_discrete_inputs(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> TestbedResult<Vec<bool>> {
        let request =
            ModbusRequest::new_read(unit_id, ModbusFunction::ReadDiscreteInputs, address, quantity);
        let response = self.execute(&request).await?;
        let mut bits = response.parse_bits()?;
        bits.truncate(quantity as usize);
        Ok(bits)
    }

    /// Read holding registers (function code 0x03)
    pub async fn read_holding_registers(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> TestbedResult<Vec<u16>> {
        let request =
            ModbusRequest::new_read(unit_id, ModbusFunction::ReadHoldingRegisters, address, quantity);
        let response = self.execute(&request).await?;
        response.parse_registers()
    }

    /// Read input registers (function code 0x04)
    pub async fn read_input_registers(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> TestbedResult<Vec<u16>> {
        let request =
            ModbusRequest::new_read(unit_id, ModbusFunction::ReadInputRegisters, address, quantity);
        let response = self.execute(&request).await?;
        response.parse_registers()
    }

    /// Write a single coil (function code 0x05)
    pub async fn write_single_coil(&mut self, unit_id: UnitId, address: u16, value: bool) -> TestbedResult<()> {
        let request = ModbusRequest::new_write(
            unit_id,
            ModbusFunction::WriteSingleCoil,
            address,
            1,
            vec![if value { 1 } else { 0 }],
        );
        self.execute(&request).await?;
        Ok(())
    }

    /// Write a single holding register (function code 0x06)
    pub async fn write_single_register(&mut self, unit_id: UnitId, address: u16, value: u16) -> TestbedResult<()> {
        let request = ModbusRequest::new_write(
            unit_id,
            ModbusFunction::WriteSingleRegister,
            address,
            1,
            value.to_be_bytes().to_vec(),
        );
        self.execute(&request).await?;
        Ok(())
    }

    /// Write multiple coils (function code 0x0F)
    pub async fn write_multiple_coils(&mut self, unit_id: UnitId, address: u16, values: &[bool]) -> TestbedResult<()> {
        if values.is_empty() {
            return Err(TestbedError::invalid_data("No coil values provided"));
        }
        let request = ModbusRequest::new_write(
            unit_id,
            ModbusFunction::WriteMultipleCoils,
            address,
            values.len() as u16,
            data_utils::pack_bits(values),
        );
        self.execute(&request).await?;
        Ok(())
    }

    /// Write multiple holding registers (function code 0x10)
    pub async fn write_multiple_registers(&mut self, unit_id: UnitId, address: u16, values: &[u16]) -> TestbedResult<()> {
        if values.is_empty() {
            return Err(TestbedError::invalid_data("No register values provided"));
        }
        let request = ModbusRequest::new_write(
            unit_id,
            ModbusFunction::WriteMultipleRegisters,
            address,
            values.len() as u16,
            data_utils::registers_to_bytes(values),
        );
        self.execute(&request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_skips_zero() {
        let mut client = ModbusTcpClient {
            stream: None,
            address: "127.0.0.1:502".parse().unwrap(),
            timeout: Duration::from_secs(1),
            transaction_id: u16::MAX,
        };
        assert_eq!(client.next_transaction_id(), 1);
        assert_eq!(client.next_transaction_id(), 2);
    }

    #[test]
    fn test_encode_read_request() {
        let mut client = ModbusTcpClient {
            stream: None,
            address: "127.0.0.1:502".parse().unwrap(),
            timeout: Duration::from_secs(1),
            transaction_id: 0,
        };

        let request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0x0010, 2);
        let frame = client.encode_request(&request);

        assert_eq!(frame.len(), 12);
        // protocol id
        assert_eq!(&frame[2..4], &[0x00, 0x00]);
        // length = unit + function + address + quantity
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]), 6);
        assert_eq!(frame[6], 1);
        assert_eq!(frame[7], 0x03);
        assert_eq!(u16::from_be_bytes([frame[8], frame[9]]), 0x0010);
        assert_eq!(u16::from_be_bytes([frame[10], frame[11]]), 2);
    }

    #[test]
    fn test_decode_exception_response() {
        let client = ModbusTcpClient {
            stream: None,
            address: "127.0.0.1:502".parse().unwrap(),
            timeout: Duration::from_secs(1),
            transaction_id: 0,
        };

        let frame = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let response = client.decode_response(&frame).unwrap();
        assert!(response.is_exception());
        assert!(matches!(
            response.get_exception(),
            Some(TestbedError::Exception { code: 0x02, .. })
        ));
    }
}
