//! Shadow copy of the device register file.
//!
//! [`RegisterSet`] is the only writer of device registers during setup.
//! Changes are staged with [`set`](RegisterSet::set) and applied by
//! [`flush`](RegisterSet::flush), which sends only dirty entries in ascending
//! address order and clears their dirty flags only when every batch was
//! acknowledged.

use std::collections::BTreeMap;

use scan_core::profile::RegisterDefault;
use scan_core::{RegisterField, RegisterMap, Result};
use tracing::debug;

use crate::channel::CommandChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    value: u8,
    dirty: bool,
}

/// Ordered register shadow with per-entry dirty flags.
#[derive(Debug, Clone)]
pub struct RegisterSet {
    map: RegisterMap,
    entries: BTreeMap<u16, Entry>,
}

impl RegisterSet {
    /// Empty shadow using `map`.
    #[must_use]
    pub fn new(map: RegisterMap) -> Self {
        Self {
            map,
            entries: BTreeMap::new(),
        }
    }

    /// Logical register layout.
    #[must_use]
    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Stage a write. Unchanged values stay clean.
    pub fn set(&mut self, addr: u16, value: u8) {
        match self.entries.get_mut(&addr) {
            Some(entry) if entry.value == value => {}
            Some(entry) => {
                entry.value = value;
                entry.dirty = true;
            }
            None => {
                self.entries.insert(addr, Entry { value, dirty: true });
            }
        }
    }

    /// Shadow value.
    #[must_use]
    pub fn get(&self, addr: u16) -> Option<u8> {
        self.entries.get(&addr).map(|e| e.value)
    }

    /// Stage a multi-byte field.
    pub fn set_field(&mut self, field: RegisterField, value: u32) -> Result<()> {
        for (addr, byte) in field.split(value)? {
            self.set(addr, byte);
        }
        Ok(())
    }

    /// Shadow value of a field; missing bytes read as zero.
    #[must_use]
    pub fn field(&self, field: RegisterField) -> u32 {
        field.assemble(|addr| self.get(addr).unwrap_or(0))
    }

    /// Set or clear `mask` in a single-byte register.
    pub fn set_bits(&mut self, field: RegisterField, mask: u8, on: bool) {
        let current = self.get(field.addr).unwrap_or(0);
        let value = if on { current | mask } else { current & !mask };
        self.set(field.addr, value);
    }

    /// Stage the model's init values.
    pub fn load_defaults(&mut self, defaults: &[RegisterDefault]) {
        for d in defaults {
            self.set(d.addr, d.value);
        }
    }

    /// Mark every entry dirty, e.g. after a device reset.
    pub fn mark_all_dirty(&mut self) {
        for entry in self.entries.values_mut() {
            entry.dirty = true;
        }
    }

    /// Number of staged writes.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }

    /// Staged writes in ascending address order.
    #[must_use]
    pub fn dirty(&self) -> Vec<(u16, u8)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(&addr, e)| (addr, e.value))
            .collect()
    }

    /// Apply all staged writes. Returns the number written.
    ///
    /// On failure nothing is marked clean; the whole flush must be retried.
    pub fn flush(&mut self, channel: &dyn CommandChannel) -> Result<usize> {
        let pending = self.dirty();
        if pending.is_empty() {
            return Ok(0);
        }
        let block = channel.max_register_block().max(1);
        for batch in pending.chunks(block) {
            channel.write_registers(batch)?;
        }
        for entry in self.entries.values_mut() {
            entry.dirty = false;
        }
        debug!(count = pending.len(), "Flushed registers");
        Ok(pending.len())
    }
}
