//! Command channels, one per framing family.
//!
//! A [`CommandChannel`] turns register and memory accesses into transport
//! calls. It never retries: any transport failure is returned as-is and the
//! enclosing operation decides what happens next.

use std::sync::Arc;

use parking_lot::Mutex;
use scan_core::protocol::{bulk_header, check_host_address, control_packet};
use scan_core::{
    AddressWindow, AsicFamily, BoxedTransport, ControlRequest, Result, ScanError,
    TransferDirection, TransferLimits,
};
use tracing::trace;

use crate::chunk::ChunkPlan;

/// Register and memory access for one device.
pub trait CommandChannel: Send + Sync {
    /// Framing family spoken by this channel.
    fn family(&self) -> AsicFamily;

    /// Write one register.
    fn write_register(&self, addr: u16, value: u8) -> Result<()>;

    /// Read one register.
    fn read_register(&self, addr: u16) -> Result<u8>;

    /// Write a batch of registers in the given order.
    fn write_registers(&self, pairs: &[(u16, u8)]) -> Result<()> {
        for &(addr, value) in pairs {
            self.write_register(addr, value)?;
        }
        Ok(())
    }

    /// Largest batch accepted by [`write_registers`](Self::write_registers).
    fn max_register_block(&self) -> usize;

    /// Fill `buf` from `window`.
    fn bulk_read(&self, window: AddressWindow, buf: &mut [u8]) -> Result<usize>;

    /// Send `data` to `window`.
    fn bulk_write(&self, window: AddressWindow, data: &[u8]) -> Result<usize>;

    /// Move `buf` in `direction`. Returns bytes transferred.
    fn bulk_transfer(
        &self,
        direction: TransferDirection,
        window: AddressWindow,
        buf: &mut [u8],
    ) -> Result<usize> {
        match direction {
            TransferDirection::Read => self.bulk_read(window, buf),
            TransferDirection::Write => self.bulk_write(window, buf),
        }
    }

    /// Discard whatever the image FIFO holds.
    fn clear_fifo(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared channel handle.
pub type SharedChannel = Arc<dyn CommandChannel>;

/// Build the channel for `family`.
pub fn open_channel(
    family: AsicFamily,
    transport: BoxedTransport,
    limits: &TransferLimits,
) -> SharedChannel {
    match family {
        AsicFamily::ControlPacket => Arc::new(ControlPacketChannel::new(transport, limits)),
        AsicFamily::BulkHeader => Arc::new(BulkHeaderChannel::new(transport, limits)),
    }
}

fn expect_len(operation: &'static str, wanted: usize, got: usize) -> Result<()> {
    if got != wanted {
        return Err(ScanError::transport(
            operation,
            format!("short transfer: {got} of {wanted} bytes"),
        ));
    }
    Ok(())
}

// =============================================================================
// Control-packet family
// =============================================================================

struct ControlPacketInner {
    transport: BoxedTransport,
    bank: Option<u8>,
}

impl ControlPacketInner {
    fn send_packet(&mut self, value: u16, index: u16, mut packet: [u8; 4]) -> Result<()> {
        let request = ControlRequest::out(control_packet::REQUEST, value, index);
        let sent = self.transport.control_transfer(request, &mut packet)?;
        expect_len("control_out", packet.len(), sent)
    }

    fn select_bank(&mut self, addr: u16) -> Result<()> {
        let bank = control_packet::bank_of(addr);
        if self.bank == Some(bank) {
            return Ok(());
        }
        let packet = control_packet::encode_register_pairs((control_packet::BANK_SELECT, bank), None);
        self.send_packet(control_packet::VALUE_WRITE_REGISTERS, 0, packet)?;
        self.bank = Some(bank);
        Ok(())
    }

    fn write_pairs(&mut self, pairs: &[(u16, u8)]) -> Result<()> {
        let mut i = 0;
        while i < pairs.len() {
            let first = pairs[i];
            self.select_bank(first.0)?;
            let second = pairs
                .get(i + 1)
                .copied()
                .filter(|next| control_packet::bank_of(next.0) == control_packet::bank_of(first.0));
            let packet = control_packet::encode_register_pairs(first, second);
            if let Err(e) = self.send_packet(control_packet::VALUE_WRITE_REGISTERS, 0, packet) {
                self.bank = None;
                return Err(e);
            }
            i += if second.is_some() { 2 } else { 1 };
        }
        Ok(())
    }

    fn read(&mut self, addr: u16) -> Result<u8> {
        self.select_bank(addr)?;
        let lo = (addr & 0xff) as u8;
        self.send_packet(control_packet::VALUE_LATCH_ADDRESS, u16::from(lo), [lo; 4])?;
        let mut buf = [0u8; 4];
        let request = ControlRequest::input(control_packet::REQUEST, control_packet::VALUE_READ_DATA, 0);
        let got = self.transport.control_transfer(request, &mut buf)?;
        expect_len("control_in", buf.len(), got)?;
        Ok(buf[0])
    }

    fn write_field(&mut self, base: u16, width: u16, value: u32) -> Result<()> {
        let bytes = value.to_le_bytes();
        let pairs: Vec<(u16, u8)> = (0..width).map(|i| (base + i, bytes[usize::from(i)])).collect();
        self.write_pairs(&pairs)
    }

    fn arm_window(&mut self, window: AddressWindow) -> Result<()> {
        if let AddressWindow::Ram { target, start } = window {
            check_host_address(start)?;
            let start = start | (u32::from(control_packet::access_bits(target)) << 16);
            self.write_field(control_packet::HOST_START_ADDR, 3, start)?;
            self.write_field(control_packet::HOST_END_ADDR, 3, 0x00ff_ffff)?;
        }
        Ok(())
    }

    fn arm_dma(&mut self, direction: TransferDirection, len: usize) -> Result<()> {
        let len = len as u32;
        let (words, value) = match direction {
            TransferDirection::Read => (len >> 1, control_packet::VALUE_DMA_READ),
            TransferDirection::Write => (len, control_packet::VALUE_DMA_WRITE),
        };
        self.write_field(control_packet::RW_SIZE, 4, words)?;
        self.send_packet(value, 0, control_packet::encode_dma_size(len))
    }
}

/// Channel for devices driven with 4-byte control packets.
pub struct ControlPacketChannel {
    inner: Mutex<ControlPacketInner>,
    max_chunk: usize,
    block: usize,
    register_block: usize,
}

impl ControlPacketChannel {
    /// Wrap `transport`.
    pub fn new(transport: BoxedTransport, limits: &TransferLimits) -> Self {
        Self {
            inner: Mutex::new(ControlPacketInner {
                transport,
                bank: None,
            }),
            max_chunk: limits.max_chunk.min(control_packet::MAX_DMA_CHUNK),
            block: limits.block_size,
            register_block: limits.register_block,
        }
    }
}

impl CommandChannel for ControlPacketChannel {
    fn family(&self) -> AsicFamily {
        AsicFamily::ControlPacket
    }

    fn write_register(&self, addr: u16, value: u8) -> Result<()> {
        self.inner.lock().write_pairs(&[(addr, value)])
    }

    fn read_register(&self, addr: u16) -> Result<u8> {
        self.inner.lock().read(addr)
    }

    fn write_registers(&self, pairs: &[(u16, u8)]) -> Result<()> {
        if pairs.len() > self.register_block {
            return Err(ScanError::invalid(
                "register_block",
                format!("{} pairs exceed block of {}", pairs.len(), self.register_block),
            ));
        }
        trace!(count = pairs.len(), "Writing register block");
        self.inner.lock().write_pairs(pairs)
    }

    fn max_register_block(&self) -> usize {
        self.register_block
    }

    fn bulk_read(&self, window: AddressWindow, buf: &mut [u8]) -> Result<usize> {
        let plan = ChunkPlan::new(buf.len(), self.max_chunk, self.block)?;
        let mut inner = self.inner.lock();
        inner.arm_window(window)?;
        let mut offset = 0;
        for split in plan {
            inner.arm_dma(TransferDirection::Read, split.len())?;
            for part in [split.bulk, split.remainder] {
                if part == 0 {
                    continue;
                }
                let got = inner.transport.bulk_read(&mut buf[offset..offset + part])?;
                expect_len("bulk_read", part, got)?;
                offset += part;
            }
            trace!(?window, offset, "DMA read chunk complete");
        }
        Ok(offset)
    }

    fn bulk_write(&self, window: AddressWindow, data: &[u8]) -> Result<usize> {
        let plan = ChunkPlan::new(data.len(), self.max_chunk, self.block)?;
        let mut inner = self.inner.lock();
        inner.arm_window(window)?;
        let mut offset = 0;
        for split in plan {
            inner.arm_dma(TransferDirection::Write, split.len())?;
            let end = offset + split.len();
            let sent = inner.transport.bulk_write(&data[offset..end])?;
            expect_len("bulk_write", split.len(), sent)?;
            offset = end;
        }
        Ok(offset)
    }

    fn clear_fifo(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.send_packet(control_packet::VALUE_CLEAR_FIFO, 0, [0; 4])?;
        inner.send_packet(control_packet::VALUE_CLEAR_FIFO_ACK, 0, [0; 4])
    }
}

// =============================================================================
// Bulk-header family
// =============================================================================

/// Channel for devices driven with 8-byte bulk headers.
pub struct BulkHeaderChannel {
    transport: Mutex<BoxedTransport>,
    max_chunk: usize,
    block: usize,
    register_block: usize,
}

impl BulkHeaderChannel {
    /// Wrap `transport`.
    pub fn new(transport: BoxedTransport, limits: &TransferLimits) -> Self {
        Self {
            transport: Mutex::new(transport),
            max_chunk: limits.max_chunk.min(bulk_header::MAX_READ_CHUNK),
            block: limits.block_size,
            register_block: limits.register_block,
        }
    }

    fn send_header(transport: &mut BoxedTransport, header: &bulk_header::BulkHeader) -> Result<()> {
        let mut bytes = header.encode();
        let request = ControlRequest::out(bulk_header::REQUEST_BUFFER, bulk_header::VALUE_BUFFER, 0);
        let sent = transport.control_transfer(request, &mut bytes)?;
        expect_len("control_out", bytes.len(), sent)
    }

    fn window_at(window: AddressWindow, offset: usize) -> AddressWindow {
        match window {
            AddressWindow::ImageFifo => window,
            AddressWindow::Ram { target, start } => AddressWindow::Ram {
                target,
                start: start + (offset / 2) as u32,
            },
        }
    }
}

impl CommandChannel for BulkHeaderChannel {
    fn family(&self) -> AsicFamily {
        AsicFamily::BulkHeader
    }

    fn write_register(&self, addr: u16, value: u8) -> Result<()> {
        let request = ControlRequest::out(
            bulk_header::REQUEST_BUFFER,
            bulk_header::register_value(bulk_header::VALUE_SET_REGISTER, addr),
            0,
        );
        let mut data = [(addr & 0xff) as u8, value];
        let sent = self.transport.lock().control_transfer(request, &mut data)?;
        expect_len("control_out", data.len(), sent)
    }

    fn read_register(&self, addr: u16) -> Result<u8> {
        let request = ControlRequest::input(
            bulk_header::REQUEST_BUFFER,
            bulk_header::register_value(bulk_header::VALUE_GET_REGISTER, addr),
            bulk_header::read_index(addr),
        );
        let mut data = [0u8; 2];
        let got = self.transport.lock().control_transfer(request, &mut data)?;
        expect_len("control_in", data.len(), got)?;
        if data[1] != bulk_header::LINK_MARKER {
            return Err(ScanError::LinkCheck {
                addr,
                marker: data[1],
            });
        }
        Ok(data[0])
    }

    fn write_registers(&self, pairs: &[(u16, u8)]) -> Result<()> {
        if pairs.len() > self.register_block {
            return Err(ScanError::invalid(
                "register_block",
                format!("{} pairs exceed block of {}", pairs.len(), self.register_block),
            ));
        }
        let (low, high): (Vec<(u16, u8)>, Vec<(u16, u8)>) =
            pairs.iter().copied().partition(|(addr, _)| *addr <= 0xff);
        if !low.is_empty() {
            let payload: Vec<u8> = low.iter().flat_map(|&(a, v)| [(a & 0xff) as u8, v]).collect();
            let mut transport = self.transport.lock();
            Self::send_header(&mut transport, &bulk_header::BulkHeader::registers(low.len()))?;
            let sent = transport.bulk_write(&payload)?;
            expect_len("bulk_write", payload.len(), sent)?;
            trace!(count = low.len(), "Wrote register block");
        }
        for (addr, value) in high {
            self.write_register(addr, value)?;
        }
        Ok(())
    }

    fn max_register_block(&self) -> usize {
        self.register_block
    }

    fn bulk_read(&self, window: AddressWindow, buf: &mut [u8]) -> Result<usize> {
        let plan = ChunkPlan::new(buf.len(), self.max_chunk, self.block)?;
        let mut transport = self.transport.lock();
        let mut offset = 0;
        for split in plan {
            let header = bulk_header::BulkHeader::for_window(
                TransferDirection::Read,
                Self::window_at(window, offset),
                split.len() as u32,
            )?;
            Self::send_header(&mut transport, &header)?;
            for part in [split.bulk, split.remainder] {
                if part == 0 {
                    continue;
                }
                let got = transport.bulk_read(&mut buf[offset..offset + part])?;
                expect_len("bulk_read", part, got)?;
                offset += part;
            }
            trace!(?window, offset, "Bulk read chunk complete");
        }
        Ok(offset)
    }

    fn bulk_write(&self, window: AddressWindow, data: &[u8]) -> Result<usize> {
        let max_chunk = self.max_chunk.min(bulk_header::MAX_WRITE_CHUNK);
        let plan = ChunkPlan::new(data.len(), max_chunk, self.block)?;
        let mut transport = self.transport.lock();
        let mut offset = 0;
        for split in plan {
            let header = bulk_header::BulkHeader::for_window(
                TransferDirection::Write,
                Self::window_at(window, offset),
                split.len() as u32,
            )?;
            Self::send_header(&mut transport, &header)?;
            let end = offset + split.len();
            let sent = transport.bulk_write(&data[offset..end])?;
            expect_len("bulk_write", split.len(), sent)?;
            offset = end;
        }
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_core::{RamTarget, Transport};
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Control(ControlRequest, Vec<u8>),
        BulkRead(usize),
        BulkWrite(Vec<u8>),
    }

    /// Records calls and answers reads from a queue.
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl Transport for Recorder {
        fn control_transfer(&mut self, request: ControlRequest, data: &mut [u8]) -> Result<usize> {
            if request.is_in() {
                if let Some(reply) = self.replies.pop_front() {
                    data.copy_from_slice(&reply);
                }
            }
            self.calls.lock().push(Call::Control(request, data.to_vec()));
            Ok(data.len())
        }

        fn bulk_read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.calls.lock().push(Call::BulkRead(buf.len()));
            buf.fill(0xab);
            Ok(buf.len())
        }

        fn bulk_write(&mut self, data: &[u8]) -> Result<usize> {
            self.calls.lock().push(Call::BulkWrite(data.to_vec()));
            Ok(data.len())
        }
    }

    fn recorder(replies: Vec<Vec<u8>>) -> (BoxedTransport, Arc<Mutex<Vec<Call>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Recorder {
                calls: Arc::clone(&calls),
                replies: replies.into(),
            }),
            calls,
        )
    }

    fn limits() -> TransferLimits {
        TransferLimits {
            max_chunk: 2048,
            block_size: 512,
            buffer_bytes: 1 << 20,
            register_block: 8,
        }
    }

    // =========================================================================
    // Control-packet framing
    // =========================================================================

    #[test]
    fn test_control_packet_pairs_and_banks() {
        let (transport, calls) = recorder(vec![]);
        let channel = ControlPacketChannel::new(transport, &limits());
        channel
            .write_registers(&[(0x10, 1), (0x11, 2), (0x160, 3)])
            .unwrap();
        let calls = calls.lock();
        let packets: Vec<Vec<u8>> = calls
            .iter()
            .map(|c| match c {
                Call::Control(_, data) => data.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            packets,
            vec![
                vec![0x5f, 0, 0x5f, 0],
                vec![0x10, 1, 0x11, 2],
                vec![0x5f, 1, 0x5f, 1],
                vec![0x60, 3, 0x60, 3],
            ]
        );
    }

    #[test]
    fn test_control_packet_bank_cached() {
        let (transport, calls) = recorder(vec![]);
        let channel = ControlPacketChannel::new(transport, &limits());
        channel.write_register(0x20, 1).unwrap();
        channel.write_register(0x21, 2).unwrap();
        assert_eq!(calls.lock().len(), 3);
    }

    #[test]
    fn test_control_packet_read() {
        let (transport, calls) = recorder(vec![vec![0x42, 0, 0, 0]]);
        let channel = ControlPacketChannel::new(transport, &limits());
        assert_eq!(channel.read_register(0x8b).unwrap(), 0x42);
        let calls = calls.lock();
        match &calls[1] {
            Call::Control(req, data) => {
                assert_eq!(req.value, control_packet::VALUE_LATCH_ADDRESS);
                assert_eq!(data, &vec![0x8b; 4]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_control_packet_dma_read_splits() {
        let (transport, calls) = recorder(vec![]);
        let channel = ControlPacketChannel::new(transport, &limits());
        let mut buf = vec![0u8; 2048 + 700];
        assert_eq!(channel.bulk_read(AddressWindow::ImageFifo, &mut buf).unwrap(), 2748);
        let reads: Vec<usize> = calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::BulkRead(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(reads, vec![2048, 512, 188]);
        assert!(buf.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_control_packet_ram_window_rejects_wide_address() {
        let (transport, _) = recorder(vec![]);
        let channel = ControlPacketChannel::new(transport, &limits());
        let window = AddressWindow::Ram {
            target: RamTarget::Gamma,
            start: 1 << 22,
        };
        assert!(channel.bulk_write(window, &[0; 16]).is_err());
    }

    #[test]
    fn test_register_block_limit() {
        let (transport, _) = recorder(vec![]);
        let channel = ControlPacketChannel::new(transport, &limits());
        let pairs: Vec<(u16, u8)> = (0..9).map(|i| (i, 0)).collect();
        assert!(matches!(
            channel.write_registers(&pairs),
            Err(ScanError::InvalidParameter { .. })
        ));
    }

    // =========================================================================
    // Bulk-header framing
    // =========================================================================

    #[test]
    fn test_bulk_header_link_check() {
        let (transport, _) = recorder(vec![vec![0x12, 0x55], vec![0x12, 0x00]]);
        let channel = BulkHeaderChannel::new(transport, &limits());
        assert_eq!(channel.read_register(0x41).unwrap(), 0x12);
        assert!(matches!(
            channel.read_register(0x41),
            Err(ScanError::LinkCheck { addr: 0x41, marker: 0 })
        ));
    }

    #[test]
    fn test_bulk_header_register_block() {
        let (transport, calls) = recorder(vec![]);
        let channel = BulkHeaderChannel::new(transport, &limits());
        channel.write_registers(&[(0x01, 0xaa), (0x02, 0xbb), (0x101, 7)]).unwrap();
        let calls = calls.lock();
        match &calls[0] {
            Call::Control(req, data) => {
                assert_eq!(req.value, bulk_header::VALUE_BUFFER);
                assert_eq!(data, &vec![0x01, 0x11, 0, 0, 4, 0, 0, 0]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls[1], Call::BulkWrite(vec![0x01, 0xaa, 0x02, 0xbb]));
        match &calls[2] {
            Call::Control(req, data) => {
                assert_eq!(req.value, 0x183);
                assert_eq!(data, &vec![0x01, 7]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bulk_header_read_headers_per_chunk() {
        let (transport, calls) = recorder(vec![]);
        let channel = BulkHeaderChannel::new(transport, &limits());
        let mut buf = vec![0u8; 3000];
        channel.bulk_read(AddressWindow::ImageFifo, &mut buf).unwrap();
        let calls = calls.lock();
        let headers = calls
            .iter()
            .filter(|c| matches!(c, Call::Control(..)))
            .count();
        assert_eq!(headers, 2);
        let reads: Vec<usize> = calls
            .iter()
            .filter_map(|c| match c {
                Call::BulkRead(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(reads, vec![2048, 512, 440]);
    }

    #[test]
    fn test_zero_sized_read_rejected_before_io() {
        let (transport, calls) = recorder(vec![]);
        let channel = BulkHeaderChannel::new(transport, &limits());
        assert!(channel.bulk_read(AddressWindow::ImageFifo, &mut []).is_err());
        assert!(calls.lock().is_empty());
    }
}
