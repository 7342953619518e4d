//! Logical register map.
//!
//! The engine programs the ASIC through named fields rather than raw
//! addresses. A [`RegisterMap`] binds each field to an address range and byte
//! order for one [`AsicFamily`]; the driver writes through it and the
//! simulated device decodes through it, so both sides agree by construction.

use bitflags::bitflags;

use crate::error::{Result, ScanError};
use crate::protocol::AsicFamily;

/// Byte order of a multi-byte register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Most significant byte at the lowest address.
    Big,
    /// Least significant byte at the lowest address.
    Little,
}

/// A value spread across 1 to 4 consecutive registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterField {
    /// Lowest address.
    pub addr: u16,
    /// Number of registers.
    pub width: u8,
    /// Byte order.
    pub order: ByteOrder,
}

impl RegisterField {
    /// Single-register field.
    #[must_use]
    pub const fn byte(addr: u16) -> Self {
        Self {
            addr,
            width: 1,
            order: ByteOrder::Big,
        }
    }

    /// Big-endian field.
    #[must_use]
    pub const fn be(addr: u16, width: u8) -> Self {
        Self {
            addr,
            width,
            order: ByteOrder::Big,
        }
    }

    /// Little-endian field.
    #[must_use]
    pub const fn le(addr: u16, width: u8) -> Self {
        Self {
            addr,
            width,
            order: ByteOrder::Little,
        }
    }

    /// Largest value the field can hold.
    #[must_use]
    pub const fn max_value(&self) -> u32 {
        if self.width >= 4 {
            u32::MAX
        } else {
            (1u32 << (8 * self.width as u32)) - 1
        }
    }

    /// Addresses covered by this field, lowest first.
    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        let addr = self.addr;
        (0..u16::from(self.width)).map(move |i| addr + i)
    }

    /// Split `value` into `(address, byte)` writes.
    pub fn split(&self, value: u32) -> Result<Vec<(u16, u8)>> {
        if value > self.max_value() {
            return Err(ScanError::invalid(
                "register_value",
                format!(
                    "{value} does not fit {} register(s) at {:#06x}",
                    self.width, self.addr
                ),
            ));
        }
        let width = usize::from(self.width);
        let bytes = value.to_le_bytes();
        Ok(self
            .addresses()
            .enumerate()
            .map(|(i, addr)| {
                let byte = match self.order {
                    ByteOrder::Little => bytes[i],
                    ByteOrder::Big => bytes[width - 1 - i],
                };
                (addr, byte)
            })
            .collect())
    }

    /// Reassemble a value from register contents.
    pub fn assemble(&self, mut read: impl FnMut(u16) -> u8) -> u32 {
        let width = usize::from(self.width);
        let mut bytes = [0u8; 4];
        for (i, addr) in self.addresses().enumerate() {
            let byte = read(addr);
            match self.order {
                ByteOrder::Little => bytes[i] = byte,
                ByteOrder::Big => bytes[width - 1 - i] = byte,
            }
        }
        u32::from_le_bytes(bytes)
    }
}

/// How a status byte is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusAccess {
    /// Plain register read.
    Direct(u16),
    /// Write `selector` to `addr`, then read `addr`.
    Selected {
        /// Status register.
        addr: u16,
        /// Selector value.
        selector: u8,
    },
}

bitflags! {
    /// Main status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u8 {
        /// Power good.
        const POWER = 0x80;
        /// Image buffer holds no data.
        const BUFFER_EMPTY = 0x40;
        /// Feed-only move finished.
        const FEED_FINISHED = 0x20;
        /// Scan finished.
        const SCAN_FINISHED = 0x10;
        /// Carriage sits on the home sensor.
        const HOME_SENSOR = 0x08;
        /// Lamp is lit.
        const LAMP = 0x04;
        /// Analog front end busy.
        const FRONT_END_BUSY = 0x02;
        /// Motor driver enabled.
        const MOTOR_ENABLED = 0x01;
    }
}

bitflags! {
    /// Motion/data-path status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MotionFlags: u8 {
        /// Data path still delivering.
        const DATA_ENABLED = 0x01;
        /// Motor still moving.
        const MOTOR_MOVING = 0x02;
    }
}

/// Bits of the scan-control register.
pub mod scan_bits {
    /// Scan enable.
    pub const SCAN_ENABLE: u8 = 0x01;
    /// Hardware shading correction.
    pub const SHADING_ENABLE: u8 = 0x02;
    /// Hardware gamma mapping.
    pub const GAMMA_ENABLE: u8 = 0x04;
}

/// Bits of the motor-control register.
pub mod motor_bits {
    /// Move in reverse (towards home).
    pub const REVERSE: u8 = 0x04;
    /// Use the fast table for the approach (two-table mode).
    pub const FAST_FEED: u8 = 0x08;
    /// Motor power.
    pub const MOTOR_ENABLE: u8 = 0x10;
    /// Stop when the home sensor trips.
    pub const HOME_ON_END: u8 = 0x20;
    /// Move without capturing.
    pub const FEED_ONLY: u8 = 0x40;
}

/// Bits of the lamp register.
pub mod lamp_bits {
    /// Lamp power.
    pub const LAMP_ON: u8 = 0x10;
}

/// Bits of the counter-clear register.
pub mod clear_bits {
    /// Reset the scanned line counter.
    pub const LINE_COUNT: u8 = 0x08;
    /// Reset the motor step counter.
    pub const MOTOR_COUNT: u8 = 0x04;
}

/// Per-family register layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    /// Family this map belongs to.
    pub family: AsicFamily,
    /// Scan enable, shading/gamma enable.
    pub scan_control: RegisterField,
    /// Motor enable, direction, feed mode.
    pub motor_control: RegisterField,
    /// Lamp power.
    pub lamp: RegisterField,
    /// Counter reset strobe.
    pub clear_counters: RegisterField,
    /// Motor start strobe.
    pub start_motor: RegisterField,
    /// Main status.
    pub status: StatusAccess,
    /// Motion/data-path status.
    pub motion_status: StatusAccess,
    /// Lines delivered by the sensor since the last clear.
    pub scan_count: RegisterField,
    /// Words waiting in the image buffer.
    pub valid_words: RegisterField,
    /// Horizontal resolution.
    pub dpi: RegisterField,
    /// First sensor pixel.
    pub start_pixel: RegisterField,
    /// Pixels per raw line.
    pub pixel_count: RegisterField,
    /// Raw lines to capture.
    pub line_count: RegisterField,
    /// Bits per raw sample.
    pub depth: RegisterField,
    /// Channels per raw pixel.
    pub channels: RegisterField,
    /// Line period in pixel clocks.
    pub line_period: RegisterField,
    /// Per-channel exposure (R, G, B).
    pub exposure: [RegisterField; 3],
    /// Per-channel analog gain.
    pub gain: [RegisterField; 3],
    /// Per-channel analog offset.
    pub offset: [RegisterField; 3],
    /// Step mode in bits 0..2, multiplier in bits 4..7.
    pub step_mode: RegisterField,
    /// Acceleration steps of the scan table.
    pub accel_steps: RegisterField,
    /// Deceleration steps.
    pub decel_steps: RegisterField,
    /// Cruise step period.
    pub cruise_speed: RegisterField,
    /// Length of the fast table.
    pub fast_steps: RegisterField,
    /// Steps to travel before or without capture.
    pub feed_steps: RegisterField,
    /// Minimum re-synchronization distance.
    pub fwd_step: RegisterField,
    /// Z-mode phase for buffer-full restarts.
    pub z1: RegisterField,
    /// Z-mode phase for the scan approach.
    pub z2: RegisterField,
    /// Motor current code.
    pub motor_current: RegisterField,
    /// Bank select register, banked families only.
    pub bank_select: Option<u16>,
    /// DMA size registers, control-packet family only.
    pub rw_size: Option<RegisterField>,
    /// Host RAM start address, control-packet family only.
    pub host_start: Option<RegisterField>,
    /// Host RAM end address, control-packet family only.
    pub host_end: Option<RegisterField>,
}

impl RegisterMap {
    /// Layout for `family`.
    #[must_use]
    pub fn for_family(family: AsicFamily) -> Self {
        match family {
            AsicFamily::ControlPacket => Self::control_packet(),
            AsicFamily::BulkHeader => Self::bulk_header(),
        }
    }

    fn control_packet() -> Self {
        use crate::protocol::control_packet as cp;
        Self {
            family: AsicFamily::ControlPacket,
            scan_control: RegisterField::byte(0xf3),
            motor_control: RegisterField::byte(0xa6),
            lamp: RegisterField::byte(0x90),
            clear_counters: RegisterField::byte(0x8d),
            start_motor: RegisterField::byte(0xf4),
            status: StatusAccess::Selected {
                addr: 0x8b,
                selector: 0x00,
            },
            motion_status: StatusAccess::Selected {
                addr: 0x8b,
                selector: 0x01,
            },
            scan_count: RegisterField::le(0x17a, 3),
            valid_words: RegisterField::le(0x17d, 3),
            dpi: RegisterField::le(0x86, 2),
            start_pixel: RegisterField::le(0x176, 2),
            pixel_count: RegisterField::le(0x174, 2),
            line_count: RegisterField::le(0x170, 3),
            depth: RegisterField::byte(0x1a),
            channels: RegisterField::byte(0x1b),
            line_period: RegisterField::le(0x178, 2),
            exposure: [
                RegisterField::le(0x1b0, 2),
                RegisterField::le(0x1b2, 2),
                RegisterField::le(0x1b4, 2),
            ],
            gain: [
                RegisterField::byte(0x160),
                RegisterField::byte(0x161),
                RegisterField::byte(0x162),
            ],
            offset: [
                RegisterField::byte(0x163),
                RegisterField::byte(0x164),
                RegisterField::byte(0x165),
            ],
            step_mode: RegisterField::byte(0xf6),
            accel_steps: RegisterField::le(0xe0, 2),
            decel_steps: RegisterField::byte(0xe5),
            cruise_speed: RegisterField::le(0xfd, 2),
            fast_steps: RegisterField::le(0x1c0, 2),
            feed_steps: RegisterField::le(0xe2, 3),
            fwd_step: RegisterField::byte(0xe6),
            z1: RegisterField::le(0x270, 3),
            z2: RegisterField::le(0x273, 3),
            motor_current: RegisterField::byte(0x250),
            bank_select: Some(cp::BANK_SELECT),
            rw_size: Some(RegisterField::le(cp::RW_SIZE, 4)),
            host_start: Some(RegisterField::le(cp::HOST_START_ADDR, 3)),
            host_end: Some(RegisterField::le(cp::HOST_END_ADDR, 3)),
        }
    }

    fn bulk_header() -> Self {
        Self {
            family: AsicFamily::BulkHeader,
            scan_control: RegisterField::byte(0x01),
            motor_control: RegisterField::byte(0x02),
            lamp: RegisterField::byte(0x03),
            clear_counters: RegisterField::byte(0x0d),
            start_motor: RegisterField::byte(0x0f),
            status: StatusAccess::Direct(0x41),
            motion_status: StatusAccess::Direct(0x40),
            scan_count: RegisterField::be(0x4b, 3),
            valid_words: RegisterField::be(0x42, 3),
            dpi: RegisterField::be(0x2c, 2),
            start_pixel: RegisterField::be(0x30, 2),
            pixel_count: RegisterField::be(0x32, 2),
            line_count: RegisterField::be(0x25, 3),
            depth: RegisterField::byte(0x04),
            channels: RegisterField::byte(0x05),
            line_period: RegisterField::be(0x38, 2),
            exposure: [
                RegisterField::be(0x10, 2),
                RegisterField::be(0x12, 2),
                RegisterField::be(0x14, 2),
            ],
            gain: [
                RegisterField::byte(0x50),
                RegisterField::byte(0x51),
                RegisterField::byte(0x52),
            ],
            offset: [
                RegisterField::byte(0x53),
                RegisterField::byte(0x54),
                RegisterField::byte(0x55),
            ],
            step_mode: RegisterField::byte(0x1e),
            accel_steps: RegisterField::be(0x20, 2),
            decel_steps: RegisterField::byte(0x23),
            cruise_speed: RegisterField::be(0x5e, 2),
            fast_steps: RegisterField::be(0x101, 2),
            feed_steps: RegisterField::be(0x3d, 3),
            fwd_step: RegisterField::byte(0x22),
            z1: RegisterField::be(0x60, 3),
            z2: RegisterField::be(0x63, 3),
            motor_current: RegisterField::byte(0x6c),
            bank_select: None,
            rw_size: None,
            host_start: None,
            host_end: None,
        }
    }

    /// Every writable field, for overlap checks and bulk defaults.
    #[must_use]
    pub fn writable_fields(&self) -> Vec<RegisterField> {
        let mut fields = vec![
            self.scan_control,
            self.motor_control,
            self.lamp,
            self.clear_counters,
            self.start_motor,
            self.dpi,
            self.start_pixel,
            self.pixel_count,
            self.line_count,
            self.depth,
            self.channels,
            self.line_period,
            self.step_mode,
            self.accel_steps,
            self.decel_steps,
            self.cruise_speed,
            self.fast_steps,
            self.feed_steps,
            self.fwd_step,
            self.z1,
            self.z2,
            self.motor_current,
        ];
        fields.extend(self.exposure);
        fields.extend(self.gain);
        fields.extend(self.offset);
        fields.extend(self.rw_size);
        fields.extend(self.host_start);
        fields.extend(self.host_end);
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_split_big_endian() {
        let field = RegisterField::be(0x25, 3);
        assert_eq!(
            field.split(0x01_0203).unwrap(),
            vec![(0x25, 0x01), (0x26, 0x02), (0x27, 0x03)]
        );
    }

    #[test]
    fn test_split_little_endian() {
        let field = RegisterField::le(0xe0, 2);
        assert_eq!(field.split(511).unwrap(), vec![(0xe0, 0xff), (0xe1, 0x01)]);
    }

    #[test]
    fn test_split_rejects_overflow() {
        assert!(RegisterField::byte(0x23).split(256).is_err());
        assert!(RegisterField::be(0x20, 2).split(0x1_0000).is_err());
        assert!(RegisterField::le(0x7c, 4).split(u32::MAX).is_ok());
    }

    #[test]
    fn test_assemble_inverts_split() {
        for field in [RegisterField::be(0x60, 3), RegisterField::le(0x270, 3)] {
            let writes: HashMap<u16, u8> = field.split(0x00ab_cdef).unwrap().into_iter().collect();
            assert_eq!(field.assemble(|a| writes[&a]), 0x00ab_cdef);
        }
    }

    #[test]
    fn test_fields_do_not_overlap() {
        for family in [AsicFamily::ControlPacket, AsicFamily::BulkHeader] {
            let map = RegisterMap::for_family(family);
            let mut seen = HashMap::new();
            for field in map.writable_fields() {
                for addr in field.addresses() {
                    assert!(
                        seen.insert(addr, field).is_none(),
                        "{family}: address {addr:#06x} used twice"
                    );
                }
            }
            if let Some(bank) = map.bank_select {
                assert!(!seen.contains_key(&bank));
            }
        }
    }

    #[test]
    fn test_banked_family_reaches_high_banks() {
        let map = RegisterMap::for_family(AsicFamily::ControlPacket);
        assert!(map.writable_fields().iter().any(|f| f.addr > 0x1ff));
        assert!(map.writable_fields().iter().all(|f| f.addr <= 0x2ff));
    }
}
