//! Per-channel gamma lookup tables.

use scan_core::{AddressWindow, RamTarget, Result, ScanError};

use crate::channel::CommandChannel;

/// Three lookup tables sized to the sample range of an 8- or 16-bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaTables {
    bits: u8,
    channels: [Vec<u16>; 3],
}

fn curve(bits: u8, gamma: f64) -> Vec<u16> {
    let max = (1u32 << bits) - 1;
    let maxf = f64::from(max);
    (0..=max)
        .map(|i| {
            let v = maxf * (f64::from(i) / maxf).powf(1.0 / gamma);
            v.round().clamp(0.0, maxf) as u16
        })
        .collect()
}

fn check_bits(bits: u8) -> Result<()> {
    if !matches!(bits, 8 | 16) {
        return Err(ScanError::invalid("gamma_bits", format!("{bits} is not 8 or 16")));
    }
    Ok(())
}

impl GammaTables {
    /// Identity mapping.
    pub fn identity(bits: u8) -> Result<Self> {
        Self::from_exponents(bits, [1.0; 3])
    }

    /// Same exponent on every channel.
    pub fn from_exponent(bits: u8, gamma: f64) -> Result<Self> {
        Self::from_exponents(bits, [gamma; 3])
    }

    /// One exponent per channel, in R, G, B order.
    pub fn from_exponents(bits: u8, gammas: [f64; 3]) -> Result<Self> {
        check_bits(bits)?;
        if let Some(bad) = gammas.iter().find(|g| !(**g > 0.0)) {
            return Err(ScanError::invalid("gamma", format!("{bad} is not positive")));
        }
        Ok(Self {
            bits,
            channels: gammas.map(|g| curve(bits, g)),
        })
    }

    /// Sample depth the tables cover.
    #[must_use]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Entries per channel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    /// Always false; tables cover the full sample range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels[0].is_empty()
    }

    /// Map `sample` through channel `channel`.
    #[must_use]
    pub fn lookup(&self, channel: usize, sample: u16) -> u16 {
        let table = &self.channels[channel.min(2)];
        table[usize::from(sample).min(table.len() - 1)]
    }

    /// Write the tables to gamma RAM, one channel after another.
    pub fn upload(&self, channel: &dyn CommandChannel) -> Result<()> {
        for (index, table) in self.channels.iter().enumerate() {
            let bytes: Vec<u8> = table.iter().flat_map(|v| v.to_le_bytes()).collect();
            let window = AddressWindow::Ram {
                target: RamTarget::Gamma,
                start: (index * table.len()) as u32,
            };
            channel.bulk_write(window, &bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;

    #[test]
    fn test_identity() {
        let g = GammaTables::identity(8).unwrap();
        assert_eq!(g.len(), 256);
        assert!((0..256u16).all(|i| g.lookup(1, i) == i));
    }

    #[test]
    fn test_sixteen_bit_size_and_endpoints() {
        let g = GammaTables::from_exponent(16, 2.2).unwrap();
        assert_eq!(g.len(), 65536);
        assert_eq!(g.lookup(0, 0), 0);
        assert_eq!(g.lookup(2, u16::MAX), u16::MAX);
        assert!(g.lookup(1, 0x4000) > 0x4000);
    }

    #[test]
    fn test_per_channel_exponents() {
        let g = GammaTables::from_exponents(8, [1.0, 2.0, 0.5]).unwrap();
        assert_eq!(g.lookup(0, 64), 64);
        assert!(g.lookup(1, 64) > 64);
        assert!(g.lookup(2, 64) < 64);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(GammaTables::identity(12).is_err());
        assert!(GammaTables::from_exponent(8, 0.0).is_err());
    }

    #[test]
    fn test_upload_places_channels() {
        let g = GammaTables::identity(8).unwrap();
        let channel = MemoryChannel::new(8);
        g.upload(&channel).unwrap();
        let ram = channel.ram.lock();
        assert_eq!(ram.len(), 3);
        assert_eq!(
            ram[2].0,
            AddressWindow::Ram {
                target: RamTarget::Gamma,
                start: 512
            }
        );
        assert_eq!(ram[0].1.len(), 512);
    }
}
