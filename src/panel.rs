/// Support operations for an interactive read/write panel
///
/// These are the functions a form-based frontend calls: read or write a
/// span of registers on a configured server, with human-readable register
/// numbering and comma-separated value input. Each operation opens its own
/// short-lived client connection, the way a manual test tool pokes at a
/// server, so a stopped or restarted server never leaves a stale handle
/// behind.

use std::time::Duration;

use log::info;

use crate::client::ModbusTcpClient;
use crate::config::ServerConfig;
use crate::error::{TestbedError, TestbedResult};
use crate::protocol::RegisterKind;
use crate::store::RegisterValue;

/// Connect timeout for panel-driven operations
const PANEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Translate a human-readable register number into a zero-based offset
pub fn human_to_offset(kind: RegisterKind, address: u32) -> TestbedResult<u16> {
    kind.human_to_offset(address).ok_or_else(|| {
        TestbedError::invalid_data(format!(
            "Address {} is below the {} numbering base {}",
            address,
            kind,
            kind.human_base()
        ))
    })
}

/// Read `count` values from a server, addressed with human numbering
pub async fn read_registers(
    target: &ServerConfig,
    kind: RegisterKind,
    address: u32,
    count: u16,
) -> TestbedResult<Vec<RegisterValue>> {
    if count == 0 {
        return Err(TestbedError::invalid_data("Count must be at least 1"));
    }
    let offset = human_to_offset(kind, address)?;

    let mut client = ModbusTcpClient::from_address(&target.endpoint(), PANEL_TIMEOUT).await?;
    let result: TestbedResult<Vec<RegisterValue>> = match kind {
        RegisterKind::Coil => client
            .read_coils(target.unit_id, offset, count)
            .await
            .map(|bits| bits.into_iter().map(RegisterValue::Bit).collect()),
        RegisterKind::DiscreteInput => client
            .read_discrete_inputs(target.unit_id, offset, count)
            .await
            .map(|bits| bits.into_iter().map(RegisterValue::Bit).collect()),
        RegisterKind::Holding => client
            .read_holding_registers(target.unit_id, offset, count)
            .await
            .map(|words| words.into_iter().map(RegisterValue::Word).collect()),
        RegisterKind::Input => client
            .read_input_registers(target.unit_id, offset, count)
            .await
            .map(|words| words.into_iter().map(RegisterValue::Word).collect()),
    };
    client.close().await?;

    if let Ok(ref values) = result {
        info!("Read {} @ {}: {}", kind, address, format_values(values));
    }
    result
}

/// Write values to a server, addressed with human numbering
///
/// Only coils and holding registers accept writes; a single value goes
/// out as the single-write function code, more than one as the
/// multiple-write code.
pub async fn write_values(
    target: &ServerConfig,
    kind: RegisterKind,
    address: u32,
    values: &[RegisterValue],
) -> TestbedResult<()> {
    if !kind.is_writable() {
        return Err(TestbedError::invalid_data(format!(
            "Register type '{}' does not support write operations",
            kind
        )));
    }
    if values.is_empty() {
        return Err(TestbedError::invalid_data("No values provided"));
    }
    let offset = human_to_offset(kind, address)?;

    let mut client = ModbusTcpClient::from_address(&target.endpoint(), PANEL_TIMEOUT).await?;
    let result = match kind {
        RegisterKind::Coil => {
            let bits = values
                .iter()
                .map(|v| match v {
                    RegisterValue::Bit(b) => Ok(*b),
                    RegisterValue::Word(_) => {
                        Err(TestbedError::invalid_data("Coil values must be bits"))
                    }
                })
                .collect::<TestbedResult<Vec<bool>>>()?;
            if bits.len() == 1 {
                client.write_single_coil(target.unit_id, offset, bits[0]).await
            } else {
                client.write_multiple_coils(target.unit_id, offset, &bits).await
            }
        }
        RegisterKind::Holding => {
            let words = values
                .iter()
                .map(|v| match v {
                    RegisterValue::Word(w) => Ok(*w),
                    RegisterValue::Bit(_) => Err(TestbedError::invalid_data(
                        "Register values must be 16-bit words",
                    )),
                })
                .collect::<TestbedResult<Vec<u16>>>()?;
            if words.len() == 1 {
                client
                    .write_single_register(target.unit_id, offset, words[0])
                    .await
            } else {
                client
                    .write_multiple_registers(target.unit_id, offset, &words)
                    .await
            }
        }
        _ => unreachable!(),
    };
    client.close().await?;

    if result.is_ok() {
        info!("Write {} @ {}: OK ({})", kind, address, format_values(values));
    }
    result
}

/// Parse comma-separated form input into typed values
///
/// Coils take `0`, `1`, `true` or `false`; registers take decimal or
/// `0x`-prefixed hex words.
pub fn parse_values(kind: RegisterKind, text: &str) -> TestbedResult<Vec<RegisterValue>> {
    let parts: Vec<&str> = text
        .split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return Err(TestbedError::invalid_data(if kind.is_bit() {
            "Please enter a coil value (0 or 1)"
        } else {
            "Please enter register values"
        }));
    }

    if kind.is_bit() {
        parts
            .iter()
            .map(|part| match part.to_ascii_lowercase().as_str() {
                "1" | "true" => Ok(RegisterValue::Bit(true)),
                "0" | "false" => Ok(RegisterValue::Bit(false)),
                other => Err(TestbedError::invalid_data(format!(
                    "Coil values must be 0 or 1, got '{}'",
                    other
                ))),
            })
            .collect()
    } else {
        parts
            .iter()
            .map(|part| parse_word(part).map(RegisterValue::Word))
            .collect()
    }
}

/// Parse a single register word, decimal or `0x`-prefixed hex
fn parse_word(text: &str) -> TestbedResult<u16> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse::<u16>()
    };
    parsed.map_err(|_| {
        TestbedError::invalid_data(format!(
            "Register values must be integers 0-65535, got '{}'",
            text
        ))
    })
}

/// Render values the way the result box shows them
pub fn format_values(values: &[RegisterValue]) -> String {
    values
        .iter()
        .map(|v| match v {
            RegisterValue::Bit(true) => "1".to_string(),
            RegisterValue::Bit(false) => "0".to_string(),
            RegisterValue::Word(w) => w.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_values() {
        assert_eq!(
            parse_values(RegisterKind::Holding, "1, 2,0x10").unwrap(),
            vec![
                RegisterValue::Word(1),
                RegisterValue::Word(2),
                RegisterValue::Word(16)
            ]
        );
        assert!(parse_values(RegisterKind::Holding, "").is_err());
        assert!(parse_values(RegisterKind::Holding, "70000").is_err());
        assert!(parse_values(RegisterKind::Holding, "abc").is_err());
    }

    #[test]
    fn test_parse_coil_values() {
        assert_eq!(
            parse_values(RegisterKind::Coil, "1,0,true,False").unwrap(),
            vec![
                RegisterValue::Bit(true),
                RegisterValue::Bit(false),
                RegisterValue::Bit(true),
                RegisterValue::Bit(false)
            ]
        );
        assert!(parse_values(RegisterKind::Coil, "2").is_err());
        assert!(parse_values(RegisterKind::Coil, " , ,").is_err());
    }

    #[test]
    fn test_human_to_offset_errors() {
        assert_eq!(human_to_offset(RegisterKind::Holding, 40005).unwrap(), 4);
        assert!(human_to_offset(RegisterKind::Holding, 395).is_err());
    }

    #[test]
    fn test_format_values() {
        let values = vec![
            RegisterValue::Word(1234),
            RegisterValue::Bit(true),
            RegisterValue::Bit(false),
        ];
        assert_eq!(format_values(&values), "1234, 1, 0");
    }
}
