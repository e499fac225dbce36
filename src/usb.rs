//! Thin safe-ish wrapper around the raw `libusb` C API via `libusb1-sys`.
//!
//! Nothing here is FL2000-specific; it is the same sliver of libusb that
//! `libosmo-fl2k.c` itself calls directly (`libusb_control_transfer`,
//! `libusb_alloc_transfer`, `libusb_submit_transfer`, ...). The rest of the
//! crate never touches `libusb1_sys` directly so that the unsafe surface
//! stays in one file.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::ptr;

use crate::error::{Fl2kError, Result};

const CTRL_VENDOR_OUT: u8 = 0x40; // LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_ENDPOINT_OUT
const CTRL_VENDOR_IN: u8 = 0xC0; // LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_ENDPOINT_IN
pub const CTRL_TIMEOUT_MS: u32 = 300;

pub const TRANSFER_TYPE_BULK: u8 = 3;

/// Mirrors `enum libusb_transfer_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    Unknown(i32),
}

impl From<i32> for TransferStatus {
    fn from(v: i32) -> Self {
        match v {
            0 => TransferStatus::Completed,
            1 => TransferStatus::Error,
            2 => TransferStatus::TimedOut,
            3 => TransferStatus::Cancelled,
            4 => TransferStatus::Stall,
            5 => TransferStatus::NoDevice,
            6 => TransferStatus::Overflow,
            other => TransferStatus::Unknown(other),
        }
    }
}

/// A private libusb context, one per open device (mirrors `fl2k_dev::ctx`).
pub struct Context {
    raw: *mut libusb1_sys::libusb_context,
}

// The context is only ever touched from the thread that owns the `Fl2kDevice`
// plus the two worker threads it spawns, and libusb itself is thread-safe for
// event handling from multiple threads. We hand out `&Context` to both
// workers, never a bare raw pointer to outside code.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn new() -> Result<Self> {
        let mut raw: *mut libusb1_sys::libusb_context = ptr::null_mut();
        let rc = unsafe { libusb1_sys::libusb_init(&mut raw) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(Context { raw })
    }

    pub fn as_raw(&self) -> *mut libusb1_sys::libusb_context {
        self.raw
    }

    /// Enumerate all devices currently attached, returning `(vid, pid, raw
    /// device pointer)` for every entry. The returned pointers stay valid
    /// only as long as the `DeviceList` guard is alive.
    pub fn device_list(&self) -> Result<DeviceList> {
        let mut list: *mut *mut libusb1_sys::libusb_device = ptr::null_mut();
        let count = unsafe { libusb1_sys::libusb_get_device_list(self.raw, &mut list) };
        if count < 0 {
            return Err(Fl2kError::from_usb_rc(count as i32));
        }
        Ok(DeviceList {
            list,
            len: count as usize,
        })
    }

    /// Pump pending USB events for up to `timeout_secs`, aborting early if
    /// `*cancel_flag != 0`. Returns the raw libusb return code.
    pub fn handle_events_timeout_completed(&self, timeout_secs: i64, cancel_flag: &mut i32) -> i32 {
        let tv = libc::timeval {
            tv_sec: timeout_secs as libc::time_t,
            tv_usec: 0,
        };
        unsafe {
            libusb1_sys::libusb_handle_events_timeout_completed(self.raw, &tv, cancel_flag as *mut i32)
        }
    }

    /// Pump any already-completed events without blocking (used while
    /// cancelling in-flight transfers so status callbacks propagate).
    pub fn handle_events_now(&self) {
        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        unsafe {
            libusb1_sys::libusb_handle_events_timeout_completed(
                self.raw,
                &tv,
                ptr::null_mut(),
            );
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { libusb1_sys::libusb_exit(self.raw) };
        }
    }
}

pub struct DeviceList {
    list: *mut *mut libusb1_sys::libusb_device,
    len: usize,
}

impl DeviceList {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Descriptor of the `idx`-th device (vid, pid).
    pub fn descriptor(&self, idx: usize) -> Result<(u16, u16)> {
        assert!(idx < self.len);
        let dev = unsafe { *self.list.add(idx) };
        let mut desc: libusb1_sys::libusb_device_descriptor = unsafe { std::mem::zeroed() };
        let rc = unsafe { libusb1_sys::libusb_get_device_descriptor(dev, &mut desc) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok((desc.idVendor, desc.idProduct))
    }

    pub fn open(&self, idx: usize) -> Result<DeviceHandle> {
        assert!(idx < self.len);
        let dev = unsafe { *self.list.add(idx) };
        let mut handle: *mut libusb1_sys::libusb_device_handle = ptr::null_mut();
        let rc = unsafe { libusb1_sys::libusb_open(dev, &mut handle) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(DeviceHandle { raw: handle })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        if !self.list.is_null() {
            unsafe { libusb1_sys::libusb_free_device_list(self.list, 1) };
        }
    }
}

/// An open device handle. Interface claiming, control transfers and transfer
/// submission all go through here.
pub struct DeviceHandle {
    raw: *mut libusb1_sys::libusb_device_handle,
}

unsafe impl Send for DeviceHandle {}
unsafe impl Sync for DeviceHandle {}

impl DeviceHandle {
    pub fn as_raw(&self) -> *mut libusb1_sys::libusb_device_handle {
        self.raw
    }

    pub fn kernel_driver_active(&self, iface: i32) -> Result<bool> {
        let rc = unsafe { libusb1_sys::libusb_kernel_driver_active(self.raw, iface) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(rc == 1)
    }

    pub fn detach_kernel_driver(&self, iface: i32) -> Result<()> {
        let rc = unsafe { libusb1_sys::libusb_detach_kernel_driver(self.raw, iface) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(())
    }

    pub fn claim_interface(&self, iface: i32) -> Result<()> {
        let rc = unsafe { libusb1_sys::libusb_claim_interface(self.raw, iface) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(())
    }

    pub fn release_interface(&self, iface: i32) -> Result<()> {
        let rc = unsafe { libusb1_sys::libusb_release_interface(self.raw, iface) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(())
    }

    pub fn set_interface_alt_setting(&self, iface: i32, alt: i32) -> Result<()> {
        let rc = unsafe { libusb1_sys::libusb_set_interface_alt_setting(self.raw, iface, alt) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(())
    }

    /// Vendor-specific control IN transfer, `bRequest = request`.
    pub fn control_in(&self, request: u8, value: u16, index: u16, data: &mut [u8]) -> Result<usize> {
        let rc = unsafe {
            libusb1_sys::libusb_control_transfer(
                self.raw,
                CTRL_VENDOR_IN,
                request,
                value,
                index,
                data.as_mut_ptr(),
                data.len() as u16,
                CTRL_TIMEOUT_MS,
            )
        };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(rc as usize)
    }

    /// Vendor-specific control OUT transfer, `bRequest = request`.
    pub fn control_out(&self, request: u8, value: u16, index: u16, data: &mut [u8]) -> Result<usize> {
        let rc = unsafe {
            libusb1_sys::libusb_control_transfer(
                self.raw,
                CTRL_VENDOR_OUT,
                request,
                value,
                index,
                data.as_mut_ptr(),
                data.len() as u16,
                CTRL_TIMEOUT_MS,
            )
        };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(rc as usize)
    }

    /// Attempt to allocate a kernel-resident zero-copy DMA buffer of `len`
    /// bytes. Returns `None` if the platform/kernel doesn't support it.
    pub fn dev_mem_alloc(&self, len: usize) -> Option<*mut u8> {
        let ptr = unsafe { libusb1_sys::libusb_dev_mem_alloc(self.raw, len) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    /// # Safety
    /// `buf` must have been returned by `dev_mem_alloc` on this same handle
    /// with the same `len`, and must not be referenced again afterwards.
    pub unsafe fn dev_mem_free(&self, buf: *mut u8, len: usize) {
        libusb1_sys::libusb_dev_mem_free(self.raw, buf, len);
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { libusb1_sys::libusb_close(self.raw) };
        }
    }
}

pub type TransferCallback = extern "C" fn(*mut libusb1_sys::libusb_transfer);

/// Owns one `struct libusb_transfer *`. Never owns the backing buffer — the
/// ring's `Slot` does, since the buffer's lifetime policy (zero-copy vs.
/// heap) differs.
pub struct Transfer {
    raw: *mut libusb1_sys::libusb_transfer,
}

unsafe impl Send for Transfer {}

impl Transfer {
    pub fn alloc() -> Result<Self> {
        let raw = unsafe { libusb1_sys::libusb_alloc_transfer(0) };
        if raw.is_null() {
            return Err(Fl2kError::NoMem);
        }
        Ok(Transfer { raw })
    }

    pub fn as_raw(&self) -> *mut libusb1_sys::libusb_transfer {
        self.raw
    }

    /// Fill as a bulk OUT transfer. `user_data` must outlive every submission
    /// of this transfer (the ring's slot owns it and frees transfers before
    /// itself, see `ring.rs`).
    ///
    /// # Safety
    /// `buffer` and `user_data` must remain valid for as long as the
    /// transfer may be in flight or pending resubmission.
    pub unsafe fn fill_bulk(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        buffer: *mut u8,
        length: usize,
        callback: TransferCallback,
        user_data: *mut c_void,
    ) {
        libusb1_sys::libusb_fill_bulk_transfer(
            self.raw,
            handle.as_raw(),
            endpoint,
            buffer,
            length as c_int,
            Some(callback),
            user_data,
            0, // BULK_TIMEOUT: no timeout, streaming is continuous
        );
    }

    pub fn submit(&self) -> Result<()> {
        let rc = unsafe { libusb1_sys::libusb_submit_transfer(self.raw) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(())
    }

    pub fn cancel(&self) -> Result<()> {
        let rc = unsafe { libusb1_sys::libusb_cancel_transfer(self.raw) };
        if rc < 0 {
            return Err(Fl2kError::from_usb_rc(rc));
        }
        Ok(())
    }

    pub fn status(&self) -> TransferStatus {
        let status = unsafe { (*self.raw).status };
        TransferStatus::from(status as i32)
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { libusb1_sys::libusb_free_transfer(self.raw) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_status_maps_libusb_enum_values() {
        assert_eq!(TransferStatus::from(0), TransferStatus::Completed);
        assert_eq!(TransferStatus::from(3), TransferStatus::Cancelled);
        assert_eq!(TransferStatus::from(5), TransferStatus::NoDevice);
        assert_eq!(TransferStatus::from(99), TransferStatus::Unknown(99));
    }
}
