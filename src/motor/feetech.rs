// Feetech STS3215 serial protocol, position mode
//
// Protocol is similar to Dynamixel Protocol 1.0:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Default serial configuration for Feetech servos
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Highest goal position: one revolution is 4096 steps.
pub const POSITION_MAX: u16 = 4095;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// ID every servo listens on; used for sync writes
const BROADCAST_ID: u8 = 0xFE;

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncWrite = 0x83,
}

/// Register addresses for STS3215
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    // RAM area (volatile)
    OperatingMode = 33,   // 1 byte: 0=position, 1=velocity, 2=PWM, 3=step
    TorqueEnable = 40,    // 1 byte: 0=off, 1=on
    Acceleration = 41,    // 1 byte, 0 = unlimited
    GoalPosition = 42,    // 2 bytes
    Lock = 55,            // 1 byte: 0=unlocked, 1=locked
    PresentPosition = 56, // 2 bytes, read-only
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
}

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from servo {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for servo {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Servo {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Checksum over everything after the header
fn checksum(data: &[u8]) -> u8 {
    let sum: u16 = data.iter().map(|&b| b as u16).sum();
    (!sum & 0xFF) as u8
}

fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8; // params + instruction + checksum
    let mut packet = Vec::with_capacity(6 + params.len());

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(instruction as u8);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));

    packet
}

/// Sync write of one 2-byte register on several servos in one packet.
/// `data` is `[(id, value), ...]`, values little-endian on the wire.
fn sync_write_packet(register: Register, data: &[(u8, u16)]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + 3 * data.len());
    params.push(register as u8);
    params.push(2); // bytes per servo
    for &(id, value) in data {
        params.push(id);
        params.extend_from_slice(&value.to_le_bytes());
    }
    build_packet(BROADCAST_ID, Instruction::SyncWrite, &params)
}

/// Validate a status packet body (`[error, params..., checksum]`) and
/// return its params.
fn decode_status(id: u8, body: &[u8]) -> Result<Vec<u8>> {
    let Some((&received, rest)) = body.split_last() else {
        return Err(FeetechError::InvalidResponse {
            id,
            reason: "Empty status packet".to_string(),
        });
    };

    let mut checksum_data = vec![id, body.len() as u8];
    checksum_data.extend_from_slice(rest);
    if checksum(&checksum_data) != received {
        return Err(FeetechError::ChecksumMismatch { id });
    }

    match rest.split_first() {
        Some((&0, params)) => Ok(params.to_vec()),
        Some((&status, _)) => Err(FeetechError::MotorError { id, status }),
        None => Err(FeetechError::InvalidResponse {
            id,
            reason: "Missing error byte".to_string(),
        }),
    }
}

/// Servo bus handle over a serial port
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        })?;

        if header[..2] != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", &header[..2]),
            });
        }
        if header[2] != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {}, got {}", expected_id, header[2]),
            });
        }

        let mut body = vec![0u8; header[3] as usize];
        self.port.read_exact(&mut body)?;
        decode_status(expected_id, &body)
    }

    pub fn ping(&mut self, id: u8) -> Result<bool> {
        self.send_packet(&build_packet(id, Instruction::Ping, &[]))?;

        match self.read_response(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        debug!("Write u8 to servo {}: reg={:?}, value={}", id, register, value);
        self.send_packet(&build_packet(id, Instruction::Write, &[register as u8, value]))?;
        self.read_response(id)?;
        Ok(())
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        self.send_packet(&build_packet(id, Instruction::Read, &[register as u8, 2]))?;

        let response = self.read_response(id)?;
        match response.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected 2 bytes, got {}", response.len()),
            }),
        }
    }

    /// Sync write goal positions. No status packet comes back.
    pub fn sync_write_positions(&mut self, data: &[(u8, u16)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        debug!("Sync write of {} goal positions", data.len());
        self.send_packet(&sync_write_packet(Register::GoalPosition, data))
    }

    pub fn enable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 1)?;
        self.write_u8(id, Register::Lock, 1)
    }

    pub fn disable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 0)?;
        self.write_u8(id, Register::Lock, 0)
    }

    /// Must be called with torque disabled.
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.write_u8(id, Register::OperatingMode, mode as u8)
    }

    pub fn set_acceleration(&mut self, id: u8, acceleration: u8) -> Result<()> {
        self.write_u8(id, Register::Acceleration, acceleration)
    }

    pub fn read_position(&mut self, id: u8) -> Result<u16> {
        self.read_u16(id, Register::PresentPosition)
    }
}
