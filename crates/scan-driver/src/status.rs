//! Status and counter reads.

use scan_core::{MotionFlags, RegisterField, RegisterMap, Result, StatusAccess, StatusFlags};

use crate::channel::CommandChannel;

fn read_access(channel: &dyn CommandChannel, access: StatusAccess) -> Result<u8> {
    match access {
        StatusAccess::Direct(addr) => channel.read_register(addr),
        StatusAccess::Selected { addr, selector } => {
            channel.write_register(addr, selector)?;
            channel.read_register(addr)
        }
    }
}

/// Main status byte.
pub fn read_status(channel: &dyn CommandChannel, map: &RegisterMap) -> Result<StatusFlags> {
    read_access(channel, map.status).map(StatusFlags::from_bits_retain)
}

/// Motion/data-path status byte.
pub fn read_motion(channel: &dyn CommandChannel, map: &RegisterMap) -> Result<MotionFlags> {
    read_access(channel, map.motion_status).map(MotionFlags::from_bits_retain)
}

/// Read a multi-byte field from the device.
pub fn read_field(channel: &dyn CommandChannel, field: RegisterField) -> Result<u32> {
    let mut bytes = Vec::with_capacity(usize::from(field.width));
    for addr in field.addresses() {
        bytes.push((addr, channel.read_register(addr)?));
    }
    Ok(field.assemble(|addr| {
        bytes
            .iter()
            .find(|(a, _)| *a == addr)
            .map_or(0, |(_, v)| *v)
    }))
}

/// Words waiting in the image buffer.
pub fn valid_words(channel: &dyn CommandChannel, map: &RegisterMap) -> Result<u32> {
    read_field(channel, map.valid_words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;
    use scan_core::AsicFamily;

    #[test]
    fn test_status_decoding() {
        let map = RegisterMap::for_family(AsicFamily::BulkHeader);
        let channel = MemoryChannel::new(8);
        if let StatusAccess::Direct(addr) = map.status {
            channel.write_register(addr, 0x88).unwrap();
        }
        let status = read_status(&channel, &map).unwrap();
        assert!(status.contains(StatusFlags::POWER | StatusFlags::HOME_SENSOR));
        assert!(!status.contains(StatusFlags::BUFFER_EMPTY));
    }

    #[test]
    fn test_selected_status_writes_selector() {
        let map = RegisterMap::for_family(AsicFamily::ControlPacket);
        let channel = MemoryChannel::new(8);
        read_motion(&channel, &map).unwrap();
        let batches = channel.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].0, 0x8b);
    }

    #[test]
    fn test_read_field_assembles_big_endian() {
        let map = RegisterMap::for_family(AsicFamily::BulkHeader);
        let channel = MemoryChannel::new(8);
        for (addr, value) in map.valid_words.split(0x0a0b0c).unwrap() {
            channel.write_register(addr, value).unwrap();
        }
        assert_eq!(valid_words(&channel, &map).unwrap(), 0x0a0b0c);
    }
}
