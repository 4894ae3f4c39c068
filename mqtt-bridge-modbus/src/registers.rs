//! The simulated device's register bank.
//!
//! Four Modbus data spaces of [`SPACE_SIZE`] slots each, guarded by a single
//! lock. The bridge writes discrete inputs; the Modbus server reads and writes
//! every space on behalf of remote clients.

use parking_lot::Mutex;
use std::fmt;

/// Number of slots in every register space.
pub const SPACE_SIZE: usize = 1000;

/// Holding register carrying the device type identifier.
pub const DEVICE_TYPE_REGISTER: u16 = 100;

/// Device type identifier reported at [`DEVICE_TYPE_REGISTER`].
pub const DEVICE_TYPE_ID: u16 = 2;

/// Register bank errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("{space} range {start}..{end} is outside 0..{max}", max = SPACE_SIZE)]
    OutOfRange {
        space: RegisterSpace,
        start: usize,
        end: usize,
    },
    #[error("{space} {index} is read-only")]
    ReadOnly { space: RegisterSpace, index: u16 },
}

/// Modbus data spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSpace {
    /// Discrete input contacts (read-only for clients, 1-bit)
    DiscreteInputs,
    /// Discrete output coils (read/write, 1-bit)
    Coils,
    /// Holding registers (read/write, 16-bit)
    HoldingRegisters,
    /// Input registers (read-only for clients, 16-bit)
    InputRegisters,
}

impl RegisterSpace {
    /// All spaces, in Modbus table order.
    pub const ALL: [RegisterSpace; 4] = [
        RegisterSpace::DiscreteInputs,
        RegisterSpace::Coils,
        RegisterSpace::HoldingRegisters,
        RegisterSpace::InputRegisters,
    ];

    /// Return the string name for this space.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterSpace::DiscreteInputs => "discrete",
            RegisterSpace::Coils => "coil",
            RegisterSpace::HoldingRegisters => "holding",
            RegisterSpace::InputRegisters => "input",
        }
    }

    /// Whether slots in this space hold a single bit.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterSpace::DiscreteInputs | RegisterSpace::Coils)
    }

    fn slot(&self) -> usize {
        match self {
            RegisterSpace::DiscreteInputs => 0,
            RegisterSpace::Coils => 1,
            RegisterSpace::HoldingRegisters => 2,
            RegisterSpace::InputRegisters => 3,
        }
    }
}

impl fmt::Display for RegisterSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register storage shared between the bridge and the Modbus server.
///
/// Every operation, including multi-slot reads and writes, holds the bank
/// lock for its whole duration, so no reader ever sees a partially applied
/// write.
pub struct RegisterBank {
    spaces: Mutex<[Box<[u16]>; 4]>,
}

impl RegisterBank {
    /// Create a zero-filled bank with the device type register preset.
    pub fn new() -> Self {
        let spaces: [Box<[u16]>; 4] = std::array::from_fn(|_| vec![0u16; SPACE_SIZE].into());
        let bank = Self {
            spaces: Mutex::new(spaces),
        };

        bank.spaces.lock()[RegisterSpace::HoldingRegisters.slot()]
            [DEVICE_TYPE_REGISTER as usize] = DEVICE_TYPE_ID;

        bank
    }

    /// Read a single slot.
    pub fn get_value(&self, space: RegisterSpace, index: u16) -> Result<u16, RegisterError> {
        let range = checked_range(space, index, 1)?;
        Ok(self.spaces.lock()[space.slot()][range.start])
    }

    /// Write a single slot. Bit spaces store any non-zero value as 1.
    pub fn set_value(
        &self,
        space: RegisterSpace,
        index: u16,
        value: u16,
    ) -> Result<(), RegisterError> {
        self.write(space, index, &[value])
    }

    /// Read `count` consecutive slots starting at `start`.
    pub fn read(
        &self,
        space: RegisterSpace,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, RegisterError> {
        let range = checked_range(space, start, count as usize)?;
        Ok(self.spaces.lock()[space.slot()][range].to_vec())
    }

    /// Write consecutive slots starting at `start`.
    ///
    /// The write is all-or-nothing: a range that leaves the space or covers
    /// the device type register changes nothing.
    pub fn write(
        &self,
        space: RegisterSpace,
        start: u16,
        values: &[u16],
    ) -> Result<(), RegisterError> {
        let range = checked_range(space, start, values.len())?;

        if space == RegisterSpace::HoldingRegisters
            && range.contains(&(DEVICE_TYPE_REGISTER as usize))
        {
            return Err(RegisterError::ReadOnly {
                space,
                index: DEVICE_TYPE_REGISTER,
            });
        }

        let mut spaces = self.spaces.lock();
        let slots = &mut spaces[space.slot()][range];
        for (slot, value) in slots.iter_mut().zip(values) {
            *slot = if space.is_bit() {
                u16::from(*value != 0)
            } else {
                *value
            };
        }

        Ok(())
    }

    /// Apply `f` to one slot under the bank lock and store the result.
    ///
    /// Used for read-modify-write requests such as Modbus mask writes.
    pub fn update(
        &self,
        space: RegisterSpace,
        index: u16,
        f: impl FnOnce(u16) -> u16,
    ) -> Result<u16, RegisterError> {
        let range = checked_range(space, index, 1)?;
        if space == RegisterSpace::HoldingRegisters && index == DEVICE_TYPE_REGISTER {
            return Err(RegisterError::ReadOnly { space, index });
        }

        let mut spaces = self.spaces.lock();
        let slot = &mut spaces[space.slot()][range.start];
        let updated = f(*slot);
        *slot = if space.is_bit() {
            u16::from(updated != 0)
        } else {
            updated
        };

        Ok(*slot)
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

fn checked_range(
    space: RegisterSpace,
    start: u16,
    count: usize,
) -> Result<std::ops::Range<usize>, RegisterError> {
    let start = start as usize;
    let end = start + count;
    if end > SPACE_SIZE {
        return Err(RegisterError::OutOfRange { space, start, end });
    }
    Ok(start..end)
}
