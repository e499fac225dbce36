//! The transfer ring: a fixed-size, ordered pool of in-flight USB bulk
//! transfers. Grounded on `fl2k_alloc_submit_transfers`,
//! `fl2k_get_next_xfer` and `_fl2k_free_async_buffers` in
//! `libosmo-fl2k.c`.
//!
//! This module only models the ring's data and its pure selection logic
//! (`next_slot`); the mutex/condvar that serialize access to it, and the
//! completion callback that drives resubmission, live in `stream.rs` since
//! they need to reach the streaming engine's shared state, not just the
//! ring (see the design note on weak back-references in `DESIGN.md`).

use log::{info, warn};

use crate::error::{Fl2kError, Result};
use crate::usb::{DeviceHandle, Transfer};

/// Bulk OUT endpoint the adapter streams pixel data on.
pub const BULK_ENDPOINT: u8 = 0x01;

/// USB request payload granularity (spec.md §3(b)): buffer lengths must be
/// a multiple of this for the stream to be gapless.
pub const USB_REQUEST_LEN: usize = 61_440;

pub const FL2K_BUF_LEN: usize = 1280 * 1024;
pub const FL2K_XFER_LEN: usize = FL2K_BUF_LEN * 3;

const _: () = assert!(FL2K_XFER_LEN % USB_REQUEST_LEN == 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufState {
    Empty,
    Submitted,
    Filled,
}

/// Where a slot's backing buffer lives. Zero-copy buffers are allocated
/// directly in the kernel's USB subsystem; userspace buffers are plain
/// heap allocations. Both are represented as a raw `(ptr, len)` pair so
/// `Slot` doesn't need a third buffer-owning enum variant per call site.
enum SlotBuffer {
    ZeroCopy { ptr: *mut u8, len: usize },
    Heap(Vec<u8>),
}

impl SlotBuffer {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            SlotBuffer::ZeroCopy { ptr, .. } => *ptr,
            SlotBuffer::Heap(v) => v.as_mut_ptr(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            SlotBuffer::ZeroCopy { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            SlotBuffer::Heap(v) => v,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            SlotBuffer::ZeroCopy { ptr, len } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
            SlotBuffer::Heap(v) => v,
        }
    }

    fn len(&self) -> usize {
        match self {
            SlotBuffer::ZeroCopy { len, .. } => *len,
            SlotBuffer::Heap(v) => v.len(),
        }
    }
}

pub struct Slot {
    pub transfer: Transfer,
    buffer: SlotBuffer,
    pub seq: u64,
    pub state: BufState,
}

impl Slot {
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }
}

pub struct TransferRing {
    slots: Vec<Slot>,
    pub xfer_buf_len: usize,
    pub use_zerocopy: bool,
    /// Handle the zero-copy buffers were allocated against, needed to free
    /// them correctly; `None` when `use_zerocopy` is false.
    zerocopy_handle_ptr: *mut libusb1_sys::libusb_device_handle,
}

unsafe impl Send for TransferRing {}

impl TransferRing {
    /// Allocate `slot_count` slots of `FL2K_XFER_LEN` bytes each, preferring
    /// kernel zero-copy buffers and falling back to userspace allocation
    /// per spec.md §4.4. Transfers are allocated but not yet filled or
    /// submitted — `fill_and_arm` does that once the completion callback is
    /// known.
    pub fn alloc(handle: &DeviceHandle, slot_count: usize) -> Result<TransferRing> {
        let xfer_buf_len = FL2K_XFER_LEN;
        let mut slots = Vec::with_capacity(slot_count);

        let mut use_zerocopy = true;
        let mut zerocopy_bufs: Vec<*mut u8> = Vec::with_capacity(slot_count);

        for _ in 0..slot_count {
            match handle.dev_mem_alloc(xfer_buf_len) {
                Some(ptr) => {
                    // Defend against a historical kernel usbfs mmap() bug:
                    // a correctly mapped buffer is zeroed by the kernel: if
                    // the first byte is nonzero, or the buffer isn't
                    // internally self-consistent, the mapping is bogus.
                    let buf = unsafe { std::slice::from_raw_parts(ptr, xfer_buf_len) };
                    let consistent = buf[0] == 0 && buf[1..].iter().all(|&b| b == buf[0]);
                    if !consistent {
                        warn!("detected kernel usbfs mmap() bug, falling back to userspace buffers");
                        use_zerocopy = false;
                        unsafe { handle.dev_mem_free(ptr, xfer_buf_len) };
                        break;
                    }
                    zerocopy_bufs.push(ptr);
                }
                None => {
                    use_zerocopy = false;
                    break;
                }
            }
        }

        if !use_zerocopy {
            for ptr in zerocopy_bufs.drain(..) {
                unsafe { handle.dev_mem_free(ptr, xfer_buf_len) };
            }
        }

        if use_zerocopy {
            info!("allocating {slot_count} zero-copy buffers");
            for ptr in zerocopy_bufs {
                let transfer = Transfer::alloc()?;
                slots.push(Slot {
                    transfer,
                    buffer: SlotBuffer::ZeroCopy {
                        ptr,
                        len: xfer_buf_len,
                    },
                    seq: 0,
                    state: BufState::Empty,
                });
            }
        } else {
            info!("allocating {slot_count} userspace buffers");
            for _ in 0..slot_count {
                let transfer = Transfer::alloc()?;
                let buf = vec![0u8; xfer_buf_len];
                if buf.len() != xfer_buf_len {
                    return Err(Fl2kError::NoMem);
                }
                slots.push(Slot {
                    transfer,
                    buffer: SlotBuffer::Heap(buf),
                    seq: 0,
                    state: BufState::Empty,
                });
            }
        }

        Ok(TransferRing {
            slots,
            xfer_buf_len,
            use_zerocopy,
            zerocopy_handle_ptr: if use_zerocopy {
                handle.as_raw()
            } else {
                std::ptr::null_mut()
            },
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        &mut self.slots[idx]
    }

    /// # Safety
    /// `callback` and `user_data[i]` must remain valid for as long as slot
    /// `i`'s transfer may be submitted or resubmitted.
    pub unsafe fn fill_and_arm(
        &mut self,
        handle: &DeviceHandle,
        callback: crate::usb::TransferCallback,
        user_data: &[*mut std::ffi::c_void],
    ) {
        debug_assert_eq!(user_data.len(), self.slots.len());
        for (slot, ud) in self.slots.iter_mut().zip(user_data.iter()) {
            let buf_ptr = slot.buffer.as_mut_ptr();
            let len = slot.buffer.len();
            slot.transfer
                .fill_bulk(handle, BULK_ENDPOINT, buf_ptr, len, callback, *ud);
        }
    }

    /// Submit the first `xfer_num` slots, marking each `Submitted`. The
    /// remaining two slots stay `Empty` for the sample worker to fill.
    pub fn submit_initial(&mut self, xfer_num: usize) -> Result<()> {
        for i in 0..xfer_num.min(self.slots.len()) {
            self.slots[i].transfer.submit()?;
            self.slots[i].state = BufState::Submitted;
        }
        Ok(())
    }

    /// Return a slot index in the requested state: for `Empty`, the first
    /// match; for `Filled`, the one with the smallest sequence number
    /// (FIFO delivery — spec.md §3, §4.4).
    pub fn next_slot(&self, want: BufState) -> Option<usize> {
        match want {
            BufState::Empty => self.slots.iter().position(|s| s.state == BufState::Empty),
            BufState::Filled => self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == BufState::Filled)
                .min_by_key(|(_, s)| s.seq)
                .map(|(i, _)| i),
            BufState::Submitted => self
                .slots
                .iter()
                .position(|s| s.state == BufState::Submitted),
        }
    }

    pub fn count_in_state(&self, want: BufState) -> usize {
        self.slots.iter().filter(|s| s.state == want).count()
    }
}

#[cfg(test)]
impl TransferRing {
    /// Build a `slot_count`-slot ring of heap buffers without touching any
    /// device, for tests that exercise the streaming engine's state
    /// machine (`stream.rs`) rather than real USB I/O. `Transfer::alloc`
    /// only mallocs a libusb transfer struct — it needs no context or
    /// device handle, so this is safe to call with no hardware present.
    pub(crate) fn for_test(slot_count: usize) -> Self {
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            slots.push(Slot {
                transfer: Transfer::alloc().expect("transfer alloc needs no device"),
                buffer: SlotBuffer::Heap(vec![0u8; USB_REQUEST_LEN]),
                seq: 0,
                state: BufState::Empty,
            });
        }
        TransferRing {
            slots,
            xfer_buf_len: USB_REQUEST_LEN,
            use_zerocopy: false,
            zerocopy_handle_ptr: std::ptr::null_mut(),
        }
    }
}

impl Drop for TransferRing {
    fn drop(&mut self) {
        if self.use_zerocopy && !self.zerocopy_handle_ptr.is_null() {
            for slot in &self.slots {
                if let SlotBuffer::ZeroCopy { ptr, len } = slot.buffer {
                    unsafe {
                        libusb1_sys::libusb_dev_mem_free(self.zerocopy_handle_ptr, ptr, len);
                    }
                }
            }
        }
        // Heap buffers and `Transfer`s free themselves via their own Drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_transfer() -> Transfer {
        Transfer::alloc().expect("alloc should not touch the device")
    }

    fn fake_ring(states: &[(BufState, u64)]) -> TransferRing {
        let slots = states
            .iter()
            .map(|(state, seq)| Slot {
                transfer: fake_transfer(),
                buffer: SlotBuffer::Heap(vec![0u8; 8]),
                seq: *seq,
                state: *state,
            })
            .collect();
        TransferRing {
            slots,
            xfer_buf_len: 8,
            use_zerocopy: false,
            zerocopy_handle_ptr: std::ptr::null_mut(),
        }
    }

    #[test]
    fn next_empty_returns_first_match() {
        let ring = fake_ring(&[
            (BufState::Submitted, 0),
            (BufState::Empty, 0),
            (BufState::Empty, 0),
        ]);
        assert_eq!(ring.next_slot(BufState::Empty), Some(1));
    }

    #[test]
    fn next_filled_returns_smallest_sequence() {
        let ring = fake_ring(&[
            (BufState::Filled, 5),
            (BufState::Filled, 2),
            (BufState::Filled, 9),
            (BufState::Empty, 0),
        ]);
        assert_eq!(ring.next_slot(BufState::Filled), Some(1));
    }

    #[test]
    fn next_filled_is_none_when_nothing_filled() {
        let ring = fake_ring(&[(BufState::Empty, 0), (BufState::Submitted, 0)]);
        assert_eq!(ring.next_slot(BufState::Filled), None);
    }

    #[test]
    fn count_in_state_matches_invariant_bound() {
        let ring = fake_ring(&[
            (BufState::Submitted, 0),
            (BufState::Submitted, 0),
            (BufState::Empty, 0),
            (BufState::Filled, 1),
        ]);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.count_in_state(BufState::Submitted), 2);
    }
}
