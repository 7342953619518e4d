//! In-memory command channel for unit tests.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use scan_core::{AddressWindow, AsicFamily, Result, ScanError};

use crate::channel::CommandChannel;

/// Register file with write logging and an optional failure point.
pub(crate) struct MemoryChannel {
    pub registers: Mutex<BTreeMap<u16, u8>>,
    pub batches: Mutex<Vec<Vec<(u16, u8)>>>,
    pub ram: Mutex<Vec<(AddressWindow, Vec<u8>)>>,
    pub fail_on_batch: Mutex<Option<usize>>,
    pub block: usize,
}

impl MemoryChannel {
    pub fn new(block: usize) -> Self {
        Self {
            registers: Mutex::new(BTreeMap::new()),
            batches: Mutex::new(Vec::new()),
            ram: Mutex::new(Vec::new()),
            fail_on_batch: Mutex::new(None),
            block,
        }
    }

    pub fn value(&self, addr: u16) -> Option<u8> {
        self.registers.lock().get(&addr).copied()
    }
}

impl CommandChannel for MemoryChannel {
    fn family(&self) -> AsicFamily {
        AsicFamily::BulkHeader
    }

    fn write_register(&self, addr: u16, value: u8) -> Result<()> {
        self.write_registers(&[(addr, value)])
    }

    fn read_register(&self, addr: u16) -> Result<u8> {
        Ok(self.value(addr).unwrap_or(0))
    }

    fn write_registers(&self, pairs: &[(u16, u8)]) -> Result<()> {
        let mut batches = self.batches.lock();
        if *self.fail_on_batch.lock() == Some(batches.len()) {
            return Err(ScanError::transport("control_out", "injected"));
        }
        batches.push(pairs.to_vec());
        let mut regs = self.registers.lock();
        for &(addr, value) in pairs {
            regs.insert(addr, value);
        }
        Ok(())
    }

    fn max_register_block(&self) -> usize {
        self.block
    }

    fn bulk_read(&self, _window: AddressWindow, buf: &mut [u8]) -> Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn bulk_write(&self, window: AddressWindow, data: &[u8]) -> Result<usize> {
        self.ram.lock().push((window, data.to_vec()));
        Ok(data.len())
    }
}
