/// Panel Demo
///
/// Drives the interactive-panel operations against a running testbed:
/// reads the seeded defaults from every register kind, writes a few
/// values the way the form would, and reads them back.
///
/// Usage: panel_demo [config.json]

use anyhow::Result;
use std::str::FromStr;

use modbus_testbed::panel;
use modbus_testbed::{ConfigStore, RegisterKind};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("🔎 Modbus Testbed Panel Demo");
    println!("============================");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| modbus_testbed::config::DEFAULT_CONFIG_PATH.to_string());
    let config = ConfigStore::new(&config_path).load()?;
    let target = config.battery_server.clone();

    println!(
        "Target: Battery Server at {} (unit {})",
        target.endpoint(),
        target.unit_id
    );

    println!("\n📖 Seeded defaults...");
    for (kind, address, count) in [
        ("holding", 40001u32, 2u16),
        ("holding", 40010, 1),
        ("input", 30001, 2),
        ("coils", 1, 2),
        ("discrete", 10001, 2),
    ] {
        let kind = RegisterKind::from_str(kind)?;
        match panel::read_registers(&target, kind, address, count).await {
            Ok(values) => println!(
                "  Read {} @ {}: {}",
                kind,
                address,
                panel::format_values(&values)
            ),
            Err(e) => eprintln!("  ❌ Read {} @ {} failed: {}", kind, address, e),
        }
    }

    println!("\n✏️  Writing form input \"11, 22, 0x2A\" to holding @ 40100...");
    let values = panel::parse_values(RegisterKind::Holding, "11, 22, 0x2A")?;
    panel::write_values(&target, RegisterKind::Holding, 40100, &values).await?;

    let readback = panel::read_registers(&target, RegisterKind::Holding, 40100, 3).await?;
    println!("  Read back: {}", panel::format_values(&readback));

    println!("\n✏️  Toggling coil @ 5...");
    let coil = panel::parse_values(RegisterKind::Coil, "1")?;
    panel::write_values(&target, RegisterKind::Coil, 5, &coil).await?;
    let readback = panel::read_registers(&target, RegisterKind::Coil, 5, 1).await?;
    println!("  Read back: {}", panel::format_values(&readback));

    println!("\n✅ Done");
    Ok(())
}
