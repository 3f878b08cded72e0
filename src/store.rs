/// Register store for server-side data
///
/// Bounded storage for one simulated device, covering all four Modbus data
/// classes. All blocks sit behind a single lock so that concurrent client
/// connections serialize against the store as a whole.

use std::sync::RwLock;

use log::warn;

use crate::config::InitialRegisters;
use crate::error::{TestbedError, TestbedResult};
use crate::protocol::RegisterKind;

/// Default number of addressable entries per register kind
pub const DEFAULT_STORE_CAPACITY: u16 = 10_000;

/// A single value read from or written to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    /// Coil or discrete input
    Bit(bool),
    /// Holding or input register
    Word(u16),
}

#[derive(Debug)]
struct StoreBlocks {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

/// Register store holding coils, discrete inputs, holding registers and
/// input registers for one simulated device.
///
/// Every operation validates `address + count` against the allocated
/// capacity and fails with [`TestbedError::OutOfRange`] without partially
/// applying anything. Zero-based addressing throughout; translation from
/// human-readable numbering happens in [`RegisterStore::seed`] and the
/// panel helpers.
#[derive(Debug)]
pub struct RegisterStore {
    capacity: u16,
    inner: RwLock<StoreBlocks>,
}

impl RegisterStore {
    /// Create a store with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_CAPACITY)
    }

    /// Create a store with a specific per-kind capacity
    pub fn with_capacity(capacity: u16) -> Self {
        let n = capacity as usize;
        Self {
            capacity,
            inner: RwLock::new(StoreBlocks {
                coils: vec![false; n],
                discrete_inputs: vec![false; n],
                holding_registers: vec![0; n],
                input_registers: vec![0; n],
            }),
        }
    }

    /// Number of addressable entries per register kind
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    fn check_range(&self, address: u16, count: u16) -> TestbedResult<()> {
        if count == 0 || (address as u32 + count as u32) > self.capacity as u32 {
            return Err(TestbedError::out_of_range(address, count, self.capacity));
        }
        Ok(())
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: u16, count: u16) -> TestbedResult<Vec<bool>> {
        self.check_range(address, count)?;
        let blocks = self
            .inner
            .read()
            .map_err(|_| TestbedError::internal("Failed to lock register store"))?;
        let start = address as usize;
        Ok(blocks.coils[start..start + count as usize].to_vec())
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_discrete_inputs(&self, address: u16, count: u16) -> TestbedResult<Vec<bool>> {
        self.check_range(address, count)?;
        let blocks = self
            .inner
            .read()
            .map_err(|_| TestbedError::internal("Failed to lock register store"))?;
        let start = address as usize;
        Ok(blocks.discrete_inputs[start..start + count as usize].to_vec())
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, count: u16) -> TestbedResult<Vec<u16>> {
        self.check_range(address, count)?;
        let blocks = self
            .inner
            .read()
            .map_err(|_| TestbedError::internal("Failed to lock register store"))?;
        let start = address as usize;
        Ok(blocks.holding_registers[start..start + count as usize].to_vec())
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: u16, count: u16) -> TestbedResult<Vec<u16>> {
        self.check_range(address, count)?;
        let blocks = self
            .inner
            .read()
            .map_err(|_| TestbedError::internal("Failed to lock register store"))?;
        let start = address as usize;
        Ok(blocks.input_registers[start..start + count as usize].to_vec())
    }

    /// Write a single coil (function code 0x05)
    pub fn write_single_coil(&self, address: u16, value: bool) -> TestbedResult<()> {
        self.write_coils(address, &[value])
    }

    /// Write multiple coils (function code 0x0F)
    pub fn write_coils(&self, address: u16, values: &[bool]) -> TestbedResult<()> {
        let count = u16::try_from(values.len())
            .map_err(|_| TestbedError::out_of_range(address, u16::MAX, self.capacity))?;
        self.check_range(address, count)?;
        let mut blocks = self
            .inner
            .write()
            .map_err(|_| TestbedError::internal("Failed to lock register store"))?;
        let start = address as usize;
        blocks.coils[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Write a single holding register (function code 0x06)
    pub fn write_single_register(&self, address: u16, value: u16) -> TestbedResult<()> {
        self.write_registers(address, &[value])
    }

    /// Write multiple holding registers (function code 0x10)
    pub fn write_registers(&self, address: u16, values: &[u16]) -> TestbedResult<()> {
        let count = u16::try_from(values.len())
            .map_err(|_| TestbedError::out_of_range(address, u16::MAX, self.capacity))?;
        self.check_range(address, count)?;
        let mut blocks = self
            .inner
            .write()
            .map_err(|_| TestbedError::internal("Failed to lock register store"))?;
        let start = address as usize;
        blocks.holding_registers[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Set discrete input values (seeding/simulation back door)
    ///
    /// Discrete inputs are read-only over the wire; this is how a test
    /// scenario puts values into them.
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> TestbedResult<()> {
        let count = u16::try_from(values.len())
            .map_err(|_| TestbedError::out_of_range(address, u16::MAX, self.capacity))?;
        self.check_range(address, count)?;
        let mut blocks = self
            .inner
            .write()
            .map_err(|_| TestbedError::internal("Failed to lock register store"))?;
        let start = address as usize;
        blocks.discrete_inputs[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Set input register values (seeding/simulation back door)
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> TestbedResult<()> {
        let count = u16::try_from(values.len())
            .map_err(|_| TestbedError::out_of_range(address, u16::MAX, self.capacity))?;
        self.check_range(address, count)?;
        let mut blocks = self
            .inner
            .write()
            .map_err(|_| TestbedError::internal("Failed to lock register store"))?;
        let start = address as usize;
        blocks.input_registers[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Read `count` values of the given kind starting at a zero-based address
    pub fn read(&self, kind: RegisterKind, address: u16, count: u16) -> TestbedResult<Vec<RegisterValue>> {
        match kind {
            RegisterKind::Coil => Ok(self
                .read_coils(address, count)?
                .into_iter()
                .map(RegisterValue::Bit)
                .collect()),
            RegisterKind::DiscreteInput => Ok(self
                .read_discrete_inputs(address, count)?
                .into_iter()
                .map(RegisterValue::Bit)
                .collect()),
            RegisterKind::Holding => Ok(self
                .read_holding_registers(address, count)?
                .into_iter()
                .map(RegisterValue::Word)
                .collect()),
            RegisterKind::Input => Ok(self
                .read_input_registers(address, count)?
                .into_iter()
                .map(RegisterValue::Word)
                .collect()),
        }
    }

    /// Write values of the given kind starting at a zero-based address
    ///
    /// This is the direct store API used by an embedding panel; it reaches
    /// all four kinds, including the two the wire protocol treats as
    /// read-only. Value variants must match the kind's width.
    pub fn write(&self, kind: RegisterKind, address: u16, values: &[RegisterValue]) -> TestbedResult<()> {
        if kind.is_bit() {
            let bits = values
                .iter()
                .map(|v| match v {
                    RegisterValue::Bit(b) => Ok(*b),
                    RegisterValue::Word(_) => Err(TestbedError::invalid_data(format!(
                        "{} values must be bits",
                        kind
                    ))),
                })
                .collect::<TestbedResult<Vec<bool>>>()?;
            match kind {
                RegisterKind::Coil => self.write_coils(address, &bits),
                RegisterKind::DiscreteInput => self.set_discrete_inputs(address, &bits),
                _ => unreachable!(),
            }
        } else {
            let words = values
                .iter()
                .map(|v| match v {
                    RegisterValue::Word(w) => Ok(*w),
                    RegisterValue::Bit(_) => Err(TestbedError::invalid_data(format!(
                        "{} values must be 16-bit words",
                        kind
                    ))),
                })
                .collect::<TestbedResult<Vec<u16>>>()?;
            match kind {
                RegisterKind::Holding => self.write_registers(address, &words),
                RegisterKind::Input => self.set_input_registers(address, &words),
                _ => unreachable!(),
            }
        }
    }

    /// Apply human-numbered initial values to the store
    ///
    /// Addresses below a kind's numbering base or beyond the capacity are
    /// skipped with a warning, matching the tolerant seeding of the
    /// datastore this simulates.
    pub fn seed(&self, initials: &InitialRegisters) {
        for (&human, &value) in &initials.holding {
            self.seed_one(RegisterKind::Holding, human, RegisterValue::Word(value));
        }
        for (&human, &value) in &initials.input {
            self.seed_one(RegisterKind::Input, human, RegisterValue::Word(value));
        }
        for (&human, &value) in &initials.coils {
            self.seed_one(RegisterKind::Coil, human, RegisterValue::Bit(value != 0));
        }
        for (&human, &value) in &initials.discrete {
            self.seed_one(RegisterKind::DiscreteInput, human, RegisterValue::Bit(value != 0));
        }
    }

    fn seed_one(&self, kind: RegisterKind, human: u32, value: RegisterValue) {
        let Some(offset) = kind.human_to_offset(human) else {
            warn!("Skipping {} initial value at {}: below numbering base", kind, human);
            return;
        };
        if let Err(e) = self.write(kind, offset, &[value]) {
            warn!("Skipping {} initial value at {}: {}", kind, human, e);
        }
    }

    /// Get store statistics (count of non-default entries per kind)
    pub fn get_stats(&self) -> RegisterStoreStats {
        let blocks = match self.inner.read() {
            Ok(blocks) => blocks,
            Err(_) => return RegisterStoreStats::default(),
        };
        RegisterStoreStats {
            coils_set: blocks.coils.iter().filter(|&&b| b).count(),
            discrete_inputs_set: blocks.discrete_inputs.iter().filter(|&&b| b).count(),
            holding_registers_set: blocks.holding_registers.iter().filter(|&&w| w != 0).count(),
            input_registers_set: blocks.input_registers.iter().filter(|&&w| w != 0).count(),
        }
    }
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Register store statistics
#[derive(Debug, Clone, Default)]
pub struct RegisterStoreStats {
    pub coils_set: usize,
    pub discrete_inputs_set: usize,
    pub holding_registers_set: usize,
    pub input_registers_set: usize,
}
