//! Bus transport boundary.
//!
//! Device enumeration and bus setup live outside this workspace. The engine
//! only needs a handle that can issue vendor control requests and bulk
//! transfers with byte-exact semantics; [`Transport`] is that handle.

use crate::error::Result;

/// `bmRequestType` for a vendor request, host to device.
pub const REQUEST_TYPE_OUT: u8 = 0x40;
/// `bmRequestType` for a vendor request, device to host.
pub const REQUEST_TYPE_IN: u8 = 0xc0;

/// Setup packet of a vendor control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlRequest {
    /// Request type; bit 7 selects device-to-host.
    pub request_type: u8,
    /// Vendor request code.
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
}

impl ControlRequest {
    /// Host-to-device vendor request.
    #[must_use]
    pub const fn out(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_OUT,
            request,
            value,
            index,
        }
    }

    /// Device-to-host vendor request.
    #[must_use]
    pub const fn input(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_IN,
            request,
            value,
            index,
        }
    }

    /// True when data flows from the device to the host.
    #[must_use]
    pub const fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Byte-exact access to the device.
///
/// Implementations must not retry. Any failure is returned as
/// [`ScanError::Transport`](crate::error::ScanError::Transport) and the caller
/// decides what to do with it.
pub trait Transport: Send {
    /// Issue a control transfer. For OUT requests `data` is sent; for IN
    /// requests it is filled. Returns the number of bytes moved.
    fn control_transfer(&mut self, request: ControlRequest, data: &mut [u8]) -> Result<usize>;

    /// Read from the bulk-in endpoint into `buf`.
    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` to the bulk-out endpoint.
    fn bulk_write(&mut self, data: &[u8]) -> Result<usize>;
}

/// Owned transport handle, as held by a command channel.
pub type BoxedTransport = Box<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_direction() {
        assert!(!ControlRequest::out(0x01, 0xb0, 0).is_in());
        assert!(ControlRequest::input(0x01, 0x07, 0).is_in());
        assert_eq!(ControlRequest::input(0x04, 0x8e, 0x4122).request_type, 0xc0);
    }
}
