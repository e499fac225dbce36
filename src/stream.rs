//! The streaming engine: two cooperating OS threads synchronized by a
//! mutex/condvar pair, matching the original's `fl2k_usb_worker` +
//! `fl2k_sample_worker` pthread pair one-to-one (spec.md §5). The sample
//! worker calls the application callback and converts samples into the
//! ring; the USB worker pumps libusb's event loop and resubmits completed
//! transfers. Grounded on `fl2k_start_tx`, `fl2k_stop_tx`,
//! `fl2k_alloc_submit_transfers`, `_libusb_callback`, `fl2k_usb_worker` and
//! `fl2k_sample_worker` in `libosmo-fl2k.c`.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use log::warn;

use crate::callback::{Fl2kCallback, Fl2kDataInfo};
use crate::convert;
use crate::device::Fl2kDevice;
use crate::error::{Fl2kError, Result};
use crate::ring::{BufState, TransferRing, FL2K_BUF_LEN};
use crate::usb::{Context, TransferStatus};

/// Default slot count when the caller passes `buf_num = 0` to `start_tx`,
/// matching the original's `DEFAULT_BUF_NUMBER`.
const DEFAULT_BUF_NUMBER: u32 = 4;

/// Upper bound on `buf_num`, resolving spec.md §9's open question: the
/// original leaves this unbounded (caller-controlled heap/zero-copy
/// allocation), we cap it so a misbehaving caller can't exhaust usbfs'
/// zero-copy DMA budget or plain memory.
const MAX_BUF_NUMBER: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AsyncStatus {
    Inactive = 0,
    Running = 1,
    Canceling = 2,
}

impl From<u8> for AsyncStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => AsyncStatus::Running,
            2 => AsyncStatus::Canceling,
            _ => AsyncStatus::Inactive,
        }
    }
}

/// Everything the completion callback, the sample worker and the USB worker
/// all need to reach. Owned by `Fl2kDevice` for the lifetime of one
/// streaming session; torn down (and the ring's transfers/buffers freed via
/// `Drop`) only after both worker threads have exited, so the raw pointers
/// `CallbackCtx` hands to libusb never dangle while a transfer could still
/// complete.
pub(crate) struct Shared {
    ring: Mutex<TransferRing>,
    cond: Condvar,
    status: AtomicU8,
    cancel: AtomicI32,
    dev_lost: AtomicBool,
    underflow_cnt: AtomicU32,
    // Kept alive only to own the heap allocations `completion_callback`'s
    // `user_data` pointers refer to; never otherwise read after start_tx.
    callback_ctxs: Vec<Box<CallbackCtx>>,
}

impl Shared {
    fn new(ring: TransferRing) -> Self {
        Shared {
            ring: Mutex::new(ring),
            cond: Condvar::new(),
            status: AtomicU8::new(AsyncStatus::Inactive as u8),
            cancel: AtomicI32::new(0),
            dev_lost: AtomicBool::new(false),
            underflow_cnt: AtomicU32::new(0),
            callback_ctxs: Vec::new(),
        }
    }

    pub(crate) fn async_status(&self) -> AsyncStatus {
        AsyncStatus::from(self.status.load(Ordering::SeqCst))
    }

    fn set_async_status(&self, s: AsyncStatus) {
        self.status.store(s as u8, Ordering::SeqCst);
    }

    pub(crate) fn dev_lost(&self) -> bool {
        self.dev_lost.load(Ordering::SeqCst)
    }

    fn set_dev_lost(&self, v: bool) {
        self.dev_lost.store(v, Ordering::SeqCst);
    }

    fn underflow_cnt(&self) -> u32 {
        self.underflow_cnt.load(Ordering::SeqCst)
    }

    fn bump_underflow(&self) {
        self.underflow_cnt.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel_flag(&self) -> i32 {
        self.cancel.load(Ordering::SeqCst)
    }

    fn set_cancel_flag(&self, v: i32) {
        self.cancel.store(v, Ordering::SeqCst);
    }

    /// `fl2k_stop_tx`'s three-way branch: cancel gracefully if running,
    /// force-finish if already cancelling, refuse if already inactive.
    fn request_stop(&self) -> Result<()> {
        match self.async_status() {
            AsyncStatus::Running => {
                self.set_async_status(AsyncStatus::Canceling);
                self.set_cancel_flag(1);
                Ok(())
            }
            AsyncStatus::Canceling => {
                self.set_async_status(AsyncStatus::Inactive);
                Ok(())
            }
            AsyncStatus::Inactive => Err(Fl2kError::Busy),
        }
    }
}

/// The weak back-reference from a transfer's `user_data` to the streaming
/// session that owns it (spec.md's design note on the ring/device cycle):
/// a raw, non-owning pointer, valid for as long as the transfer it's
/// attached to may be submitted or resubmitted.
struct CallbackCtx {
    shared: *const Shared,
    index: usize,
}

unsafe impl Send for CallbackCtx {}
unsafe impl Sync for CallbackCtx {}

/// Send wrapper so a raw pointer to `Shared` can be moved into a worker
/// thread closure; safety follows from `Shared`'s lifetime guarantee above.
struct SharedPtr(*const Shared);
unsafe impl Send for SharedPtr {}

/// libusb transfer completion callback. Runs on whichever thread is inside
/// `libusb_handle_events_timeout_completed` at the time (the USB worker).
/// Grounded on `_libusb_callback`.
extern "C" fn completion_callback(xfer: *mut libusb1_sys::libusb_transfer) {
    let ctx = unsafe {
        let user_data = (*xfer).user_data as *const CallbackCtx;
        if user_data.is_null() {
            return;
        }
        &*user_data
    };
    let shared = unsafe { &*ctx.shared };
    let status = TransferStatus::from(unsafe { (*xfer).status } as i32);

    let mut resubmit_failed = false;

    {
        let mut ring = shared.ring.lock().expect("ring mutex poisoned");

        if status == TransferStatus::Completed && shared.async_status() == AsyncStatus::Running {
            if let Some(next_idx) = ring.next_slot(BufState::Filled) {
                let rc = ring.slot(next_idx).transfer.submit();
                ring.slot_mut(next_idx).state = BufState::Submitted;
                ring.slot_mut(ctx.index).state = BufState::Empty;
                resubmit_failed = rc.is_err();
            } else {
                // Nothing ready yet: resubmit the same buffer anyway, or
                // the device stops outputting data entirely and hangs.
                resubmit_failed = ring.slot(ctx.index).transfer.submit().is_err();
                shared.bump_underflow();
            }
        }

        if status != TransferStatus::Completed && status != TransferStatus::Cancelled {
            resubmit_failed = true;
        }
    }

    shared.cond.notify_one();

    if resubmit_failed {
        shared.set_dev_lost(true);
        let _ = shared.request_stop();
        warn!("transfer status {status:?}, canceling stream");
        shared.cond.notify_one();
    }
}

fn sample_worker_loop(shared: SharedPtr, mut callback: Fl2kCallback, using_zerocopy: bool) {
    let shared = unsafe { &*shared.0 };
    let mut underflows_seen = shared.underflow_cnt();
    let mut buf_cnt: u64 = 0;

    loop {
        if shared.async_status() != AsyncStatus::Running {
            break;
        }

        let current_underflow = shared.underflow_cnt();
        if current_underflow > underflows_seen {
            warn!(
                "underflow: skipped {} buffer(s)",
                current_underflow - underflows_seen
            );
            underflows_seen = current_underflow;
        }

        let mut info = Fl2kDataInfo::fresh(FL2K_BUF_LEN as u32, current_underflow, using_zerocopy);
        callback(&mut info);

        let mut ring = shared.ring.lock().expect("ring mutex poisoned");
        let mut idx = ring.next_slot(BufState::Empty);

        if idx.is_none() {
            ring = shared.cond.wait(ring).expect("ring mutex poisoned");
            if shared.async_status() != AsyncStatus::Running {
                break;
            }
            idx = ring.next_slot(BufState::Empty);
            if idx.is_none() {
                warn!("no free transfer buffer, dropping this callback's samples");
                continue;
            }
        }
        let idx = idx.expect("checked above");

        let slot = ring.slot_mut(idx);
        let buf = slot.buffer_mut();
        convert::convert_r(buf, info.r_buf, info.r_signed);
        convert::convert_g(buf, info.g_buf, info.g_signed);
        convert::convert_b(buf, info.b_buf, info.b_signed);
        slot.seq = buf_cnt;
        slot.state = BufState::Filled;
        buf_cnt += 1;
    }

    if shared.dev_lost() {
        let mut info = Fl2kDataInfo::device_error(using_zerocopy);
        callback(&mut info);
    }
}

fn usb_worker_loop(shared: SharedPtr, ctx: std::sync::Arc<Context>, sample_worker: JoinHandle<()>) {
    let shared = unsafe { &*shared.0 };

    while shared.async_status() == AsyncStatus::Running {
        let mut cancel = shared.cancel_flag();
        ctx.handle_events_timeout_completed(1, &mut cancel);
        shared.set_cancel_flag(cancel);
    }

    let mut next_status = AsyncStatus::Inactive;

    while shared.async_status() != AsyncStatus::Inactive {
        let mut cancel = shared.cancel_flag();
        let r = ctx.handle_events_timeout_completed(1, &mut cancel);
        shared.set_cancel_flag(cancel);

        if r < 0 {
            const LIBUSB_ERROR_INTERRUPTED: i32 = -10;
            if r == LIBUSB_ERROR_INTERRUPTED {
                continue;
            }
            break;
        }

        if shared.async_status() == AsyncStatus::Canceling {
            next_status = AsyncStatus::Inactive;
            let mut any_pending = false;

            let pending: Vec<usize> = {
                let ring = shared.ring.lock().expect("ring mutex poisoned");
                (0..ring.len())
                    .filter(|&i| ring.slot(i).transfer.status() != TransferStatus::Cancelled)
                    .collect()
            };

            for i in pending {
                let cancelled = {
                    let ring = shared.ring.lock().expect("ring mutex poisoned");
                    ring.slot(i).transfer.cancel().is_ok()
                };
                if cancelled {
                    any_pending = true;
                }
                // Handle events with the ring lock released: a transfer
                // cancelled above can complete inline inside this call, and
                // completion_callback locks the same ring mutex. Holding it
                // here would self-deadlock the USB worker thread.
                ctx.handle_events_now();
            }

            if any_pending {
                next_status = AsyncStatus::Canceling;
            }

            if shared.dev_lost() || next_status == AsyncStatus::Inactive {
                ctx.handle_events_now();
                break;
            }
        }
    }

    // Wake the sample worker so it observes the non-Running status and
    // exits, then wait for it before declaring the session inactive.
    shared.cond.notify_one();
    let _ = sample_worker.join();

    shared.set_async_status(next_status);
}

impl Fl2kDevice {
    /// Start a streaming session: allocate the transfer ring, submit the
    /// initial transfers, and spawn the sample/USB worker pair. `buf_num`
    /// of `0` uses the default slot count; values above `MAX_BUF_NUMBER`
    /// are clamped.
    pub fn start_tx(&mut self, callback: Fl2kCallback, buf_num: u32) -> Result<()> {
        if self.shared.is_some() {
            return Err(Fl2kError::Busy);
        }

        let xfer_num = if buf_num == 0 {
            DEFAULT_BUF_NUMBER
        } else if buf_num > MAX_BUF_NUMBER {
            warn!("buf_num {buf_num} exceeds the {MAX_BUF_NUMBER}-slot cap, clamping");
            MAX_BUF_NUMBER
        } else {
            buf_num
        } as usize;

        // Two spare slots can be filled by the sample worker while the
        // rest are in flight or awaiting resubmission.
        let slot_count = xfer_num + 2;
        let ring = TransferRing::alloc(&self.handle, slot_count)?;
        let using_zerocopy = ring.use_zerocopy;

        let mut shared = Box::new(Shared::new(ring));
        let shared_ptr: *const Shared = &*shared;

        let ctxs: Vec<Box<CallbackCtx>> = (0..slot_count)
            .map(|i| {
                Box::new(CallbackCtx {
                    shared: shared_ptr,
                    index: i,
                })
            })
            .collect();
        let user_data: Vec<*mut c_void> = ctxs
            .iter()
            .map(|b| &**b as *const CallbackCtx as *mut c_void)
            .collect();

        {
            let mut ring_guard = shared.ring.lock().expect("ring mutex poisoned");
            unsafe {
                ring_guard.fill_and_arm(&self.handle, completion_callback, &user_data);
            }
            ring_guard.submit_initial(xfer_num)?;
        }

        shared.callback_ctxs = ctxs;
        shared.set_async_status(AsyncStatus::Running);

        let sample_shared_ptr = SharedPtr(shared_ptr);
        let sample_handle = std::thread::Builder::new()
            .name("fl2k-sample".into())
            .spawn(move || sample_worker_loop(sample_shared_ptr, callback, using_zerocopy))
            .map_err(|_| Fl2kError::Busy)?;

        let usb_shared_ptr = SharedPtr(shared_ptr);
        let usb_ctx = std::sync::Arc::clone(&self.ctx);
        let usb_handle = std::thread::Builder::new()
            .name("fl2k-usb".into())
            .spawn(move || usb_worker_loop(usb_shared_ptr, usb_ctx, sample_handle))
            .map_err(|_| Fl2kError::Busy)?;

        self.shared = Some(shared);
        self.usb_worker = Some(usb_handle);

        Ok(())
    }

    /// Request the current streaming session stop. Returns immediately;
    /// the worker threads wind down asynchronously (poll `is_lost` or
    /// `close` to wait for full teardown).
    pub fn stop_tx(&mut self) -> Result<()> {
        match &self.shared {
            Some(shared) => shared.request_stop(),
            None => Err(Fl2kError::Busy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_buf_number_yields_a_six_slot_ring() {
        // spec-level boundary case: start_tx(buf_num = 0) allocates
        // xfer_num + 2 slots with the default xfer_num of 4.
        assert_eq!(DEFAULT_BUF_NUMBER + 2, 6);
    }

    #[test]
    fn async_status_round_trips_through_u8() {
        assert_eq!(AsyncStatus::from(0), AsyncStatus::Inactive);
        assert_eq!(AsyncStatus::from(1), AsyncStatus::Running);
        assert_eq!(AsyncStatus::from(2), AsyncStatus::Canceling);
        assert_eq!(AsyncStatus::from(99), AsyncStatus::Inactive);
    }

    #[test]
    fn second_stop_tx_after_first_returns_busy() {
        let shared = Shared::new(TransferRing::for_test(6));
        shared.set_async_status(AsyncStatus::Running);

        assert!(shared.request_stop().is_ok());
        assert_eq!(shared.async_status(), AsyncStatus::Canceling);

        // Simulate the USB worker having finished draining transfers.
        shared.set_async_status(AsyncStatus::Inactive);
        assert!(matches!(shared.request_stop(), Err(Fl2kError::Busy)));
    }

    #[test]
    fn stop_tx_while_canceling_forces_inactive() {
        let shared = Shared::new(TransferRing::for_test(6));
        shared.set_async_status(AsyncStatus::Canceling);
        assert!(shared.request_stop().is_ok());
        assert_eq!(shared.async_status(), AsyncStatus::Inactive);
    }
}
