//! Wire-level constants and command framing for both ASIC generations.
//!
//! # Framing families
//!
//! - [`AsicFamily::ControlPacket`]: every command is a 4-byte control packet
//!   on request `0x01`. Register writes carry two `(address, value)` pairs per
//!   packet; addresses above `0xFF` are reached through a bank-select
//!   register. DMA transfers are armed with a 4-byte little-endian size.
//! - [`AsicFamily::BulkHeader`]: registers are written as `[reg, value]`
//!   control packets and read back with a trailing link marker. Bulk
//!   transfers are preceded by an 8-byte header carrying direction, memory
//!   space, address and payload length, least-significant byte first.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Command framing family of the sensor-control ASIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsicFamily {
    /// 4-byte control packets, banked register space.
    ControlPacket,
    /// 8-byte bulk headers, link-checked register reads.
    BulkHeader,
}

impl std::fmt::Display for AsicFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ControlPacket => write!(f, "control_packet"),
            Self::BulkHeader => write!(f, "bulk_header"),
        }
    }
}

/// Direction of a bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Device to host.
    Read,
    /// Host to device.
    Write,
}

/// On-chip RAM regions reachable through bulk transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RamTarget {
    /// Shading (dark/white correction) RAM.
    Shading,
    /// Gamma lookup RAM.
    Gamma,
    /// Motor slope table RAM.
    Slope,
}

/// Target of a bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressWindow {
    /// Scanned image data FIFO.
    ImageFifo,
    /// A RAM region starting at a word address.
    Ram {
        /// Region.
        target: RamTarget,
        /// Start address in 16-bit words.
        start: u32,
    },
}

/// Constants for the control-packet family.
pub mod control_packet {
    /// Vendor request used for every command.
    pub const REQUEST: u8 = 0x01;
    /// Packet carrying two register writes.
    pub const VALUE_WRITE_REGISTERS: u16 = 0xb0;
    /// Latch the register address for the next read.
    pub const VALUE_LATCH_ADDRESS: u16 = 0x04;
    /// Read back the latched register.
    pub const VALUE_READ_DATA: u16 = 0x07;
    /// First half of the FIFO clear sequence.
    pub const VALUE_CLEAR_FIFO: u16 = 0x05;
    /// Second half of the FIFO clear sequence.
    pub const VALUE_CLEAR_FIFO_ACK: u16 = 0xc0;
    /// Arm a DMA read of the size carried in the packet.
    pub const VALUE_DMA_READ: u16 = 0x03;
    /// Arm a DMA write of the size carried in the packet.
    pub const VALUE_DMA_WRITE: u16 = 0x02;
    /// Every packet is this long.
    pub const PACKET_LEN: usize = 4;
    /// Register selecting the active 256-register bank.
    pub const BANK_SELECT: u16 = 0x5f;
    /// DMA size registers, little-endian across four addresses.
    pub const RW_SIZE: u16 = 0x7c;
    /// Host RAM start address, 22 bits across three addresses.
    pub const HOST_START_ADDR: u16 = 0xa0;
    /// Host RAM end address.
    pub const HOST_END_ADDR: u16 = 0xa3;
    /// Largest DMA chunk the ASIC accepts.
    pub const MAX_DMA_CHUNK: usize = 32 * 1024;

    /// Bank holding `addr`.
    #[must_use]
    pub const fn bank_of(addr: u16) -> u8 {
        (addr >> 8) as u8
    }

    /// Pack two register writes into one packet. A single write is sent
    /// by repeating it.
    #[must_use]
    pub fn encode_register_pairs(first: (u16, u8), second: Option<(u16, u8)>) -> [u8; PACKET_LEN] {
        let (addr_b, val_b) = second.unwrap_or(first);
        [
            (first.0 & 0xff) as u8,
            first.1,
            (addr_b & 0xff) as u8,
            val_b,
        ]
    }

    /// DMA size packet.
    #[must_use]
    pub fn encode_dma_size(size: u32) -> [u8; PACKET_LEN] {
        size.to_le_bytes()
    }

    /// Access bits OR'ed into the top address byte to pick a RAM region.
    #[must_use]
    pub const fn access_bits(target: super::RamTarget) -> u8 {
        match target {
            super::RamTarget::Shading => 0x00,
            super::RamTarget::Gamma => 0x40,
            super::RamTarget::Slope => 0x80,
        }
    }
}

/// Constants and header codec for the bulk-header family.
pub mod bulk_header {
    use super::{AddressWindow, RamTarget, TransferDirection};
    use crate::error::{Result, ScanError};

    /// Request code for buffer and register traffic.
    pub const REQUEST_BUFFER: u8 = 0x04;
    /// `wValue` announcing an 8-byte bulk header.
    pub const VALUE_BUFFER: u16 = 0x82;
    /// `wValue` for a `[reg, value]` register write.
    pub const VALUE_SET_REGISTER: u16 = 0x83;
    /// `wValue` for a link-checked register read.
    pub const VALUE_GET_REGISTER: u16 = 0x8e;
    /// OR'ed into `wValue` when the register address is above `0xFF`.
    pub const HIGH_REGISTER: u16 = 0x100;
    /// Low byte of `wIndex` on register reads.
    pub const READ_INDEX_BASE: u16 = 0x22;
    /// Second byte of every register read on a healthy link.
    pub const LINK_MARKER: u8 = 0x55;
    /// Header length.
    pub const HEADER_LEN: usize = 8;
    /// Largest bulk-in chunk.
    pub const MAX_READ_CHUNK: usize = 0xeff0;
    /// Largest bulk-out chunk.
    pub const MAX_WRITE_CHUNK: usize = 0xf000;

    const DIR_IN: u8 = 0x00;
    const DIR_OUT: u8 = 0x01;

    /// Memory space byte of the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(u8)]
    pub enum Space {
        /// Image FIFO.
        ImageFifo = 0x10,
        /// Register block, payload is `(addr, value)` pairs.
        Registers = 0x11,
        /// Shading RAM.
        Shading = 0x20,
        /// Gamma RAM.
        Gamma = 0x21,
        /// Slope table RAM.
        Slope = 0x22,
    }

    impl Space {
        fn from_byte(b: u8) -> Option<Self> {
            Some(match b {
                0x10 => Self::ImageFifo,
                0x11 => Self::Registers,
                0x20 => Self::Shading,
                0x21 => Self::Gamma,
                0x22 => Self::Slope,
                _ => return None,
            })
        }
    }

    /// Decoded 8-byte bulk header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BulkHeader {
        /// Transfer direction.
        pub direction: TransferDirection,
        /// Target memory space.
        pub space: Space,
        /// Start word address inside the space.
        pub address: u16,
        /// Payload length in bytes.
        pub size: u32,
    }

    impl BulkHeader {
        /// Header for a transfer to or from `window`.
        pub fn for_window(
            direction: TransferDirection,
            window: AddressWindow,
            size: u32,
        ) -> Result<Self> {
            let (space, address) = match window {
                AddressWindow::ImageFifo => (Space::ImageFifo, 0),
                AddressWindow::Ram { target, start } => {
                    let address = u16::try_from(start).map_err(|_| {
                        ScanError::invalid("address_window", format!("start {start:#x} exceeds 16 bits"))
                    })?;
                    let space = match target {
                        RamTarget::Shading => Space::Shading,
                        RamTarget::Gamma => Space::Gamma,
                        RamTarget::Slope => Space::Slope,
                    };
                    (space, address)
                }
            };
            Ok(Self {
                direction,
                space,
                address,
                size,
            })
        }

        /// Header announcing a block of register pairs.
        #[must_use]
        pub fn registers(pairs: usize) -> Self {
            Self {
                direction: TransferDirection::Write,
                space: Space::Registers,
                address: 0,
                size: (pairs * 2) as u32,
            }
        }

        /// Wire encoding.
        #[must_use]
        pub fn encode(&self) -> [u8; HEADER_LEN] {
            let dir = match self.direction {
                TransferDirection::Read => DIR_IN,
                TransferDirection::Write => DIR_OUT,
            };
            let addr = self.address.to_le_bytes();
            let size = self.size.to_le_bytes();
            [
                dir,
                self.space as u8,
                addr[0],
                addr[1],
                size[0],
                size[1],
                size[2],
                size[3],
            ]
        }

        /// Parse a header received by a device.
        pub fn decode(bytes: &[u8]) -> Result<Self> {
            if bytes.len() != HEADER_LEN {
                return Err(ScanError::invalid(
                    "bulk_header",
                    format!("expected {HEADER_LEN} bytes, got {}", bytes.len()),
                ));
            }
            let direction = match bytes[0] {
                DIR_IN => TransferDirection::Read,
                DIR_OUT => TransferDirection::Write,
                other => {
                    return Err(ScanError::invalid(
                        "bulk_header",
                        format!("unknown direction byte {other:#04x}"),
                    ))
                }
            };
            let space = Space::from_byte(bytes[1]).ok_or_else(|| {
                ScanError::invalid("bulk_header", format!("unknown space {:#04x}", bytes[1]))
            })?;
            Ok(Self {
                direction,
                space,
                address: u16::from_le_bytes([bytes[2], bytes[3]]),
                size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            })
        }
    }

    /// `wIndex` of a register read.
    #[must_use]
    pub const fn read_index(addr: u16) -> u16 {
        READ_INDEX_BASE + ((addr & 0xff) << 8)
    }

    /// `wValue` of a register read or write, high-register bit included.
    #[must_use]
    pub const fn register_value(base: u16, addr: u16) -> u16 {
        if addr > 0xff {
            HIGH_REGISTER | base
        } else {
            base
        }
    }
}

/// Validate that a RAM window start fits the 22-bit host address space of
/// the control-packet family.
pub fn check_host_address(start: u32) -> Result<()> {
    if start >= 1 << 22 {
        return Err(ScanError::invalid(
            "address_window",
            format!("start {start:#x} exceeds 22 bits"),
        ));
    }
    Ok(())
}
