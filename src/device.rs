//! Device enumeration and lifecycle: finding known FL2000-class adapters,
//! opening and claiming the streaming interface, the boot register
//! sequence, and teardown. Grounded on `fl2k_open`, `fl2k_close`,
//! `fl2k_init_device`, `fl2k_deinit_device`, `find_known_device` and
//! `known_devices` in `libosmo-fl2k.c`.

use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Fl2kError, Result};
use crate::regs::write_reg;
use crate::stream::{AsyncStatus, Shared};
use crate::usb::{Context, DeviceHandle};

/// One entry in the known vendor/product ID table.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
}

pub const KNOWN_DEVICES: &[DeviceInfo] = &[DeviceInfo {
    vid: 0x1d5c,
    pid: 0x2000,
    name: "FL2000DX OEM",
}];

fn find_known_device(vid: u16, pid: u16) -> Option<&'static DeviceInfo> {
    KNOWN_DEVICES.iter().find(|d| d.vid == vid && d.pid == pid)
}

/// Count attached devices recognized as FL2000-class adapters.
pub fn device_count() -> Result<u32> {
    let ctx = Context::new()?;
    let list = ctx.device_list()?;

    let mut count = 0;
    for i in 0..list.len() {
        if let Ok((vid, pid)) = list.descriptor(i) {
            if find_known_device(vid, pid).is_some() {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Name of the `index`-th recognized device currently attached, if any.
pub fn device_name(index: u32) -> Result<Option<&'static str>> {
    let ctx = Context::new()?;
    let list = ctx.device_list()?;

    let mut seen = 0u32;
    for i in 0..list.len() {
        if let Ok((vid, pid)) = list.descriptor(i) {
            if let Some(dev) = find_known_device(vid, pid) {
                if seen == index {
                    return Ok(Some(dev.name));
                }
                seen += 1;
            }
        }
    }
    Ok(None)
}

/// All recognized devices currently attached, in enumeration order.
pub fn enumerate() -> Result<Vec<DeviceInfo>> {
    let ctx = Context::new()?;
    let list = ctx.device_list()?;

    let mut found = Vec::new();
    for i in 0..list.len() {
        if let Ok((vid, pid)) = list.descriptor(i) {
            if let Some(dev) = find_known_device(vid, pid) {
                found.push(*dev);
            }
        }
    }
    Ok(found)
}

/// Register boot sequence bringing the DAC/PLL/blanking logic to a known
/// state. These are opaque vendor register pokes with no documentation
/// beyond what the original's inline comments give; copied verbatim from
/// `fl2k_init_device`.
fn init_device(handle: &DeviceHandle) -> Result<()> {
    write_reg(handle, 0x8020, 0xdf0000cc)?;

    // lowest possible DAC frequency, to avoid underrun while the rest of
    // this sequence runs
    write_reg(handle, 0x802c, 0x00416f3f)?;

    write_reg(handle, 0x8048, 0x7ffb8004)?;
    write_reg(handle, 0x803c, 0xd701004d)?;
    write_reg(handle, 0x8004, 0x0000031c)?;
    write_reg(handle, 0x8004, 0x0010039d)?;
    write_reg(handle, 0x8008, 0x07800898)?;

    write_reg(handle, 0x801c, 0x00000000)?;
    write_reg(handle, 0x0070, 0x04186085)?;

    // blanking magic
    write_reg(handle, 0x8008, 0xfeff0780)?;
    write_reg(handle, 0x800c, 0x0000f001)?;

    // VSYNC magic
    write_reg(handle, 0x8010, 0x0400042a)?;
    write_reg(handle, 0x8014, 0x0010002d)?;

    write_reg(handle, 0x8004, 0x00000002)?;

    Ok(())
}

/// No-op, matching the original's `fl2k_deinit_device`: it never grew a real
/// implementation upstream beyond its own "TODO, power down DACs, PLL, put
/// device in reset" comment. We keep the hook (rather than dropping it) so a
/// future power-down sequence has somewhere to go without touching callers.
fn deinit_device(_handle: &DeviceHandle) {}

/// Interface the OEM adapter's SPI-flash-as-mass-storage endpoint lives on;
/// has to be detached from the kernel driver before the vendor interface can
/// be claimed.
const INTERFACE_MASS_STORAGE: i32 = 3;

/// An open FL2000-class device. Owns the libusb context and device handle
/// for its entire lifetime; only one streaming session (`start_tx`/
/// `stop_tx` pair) may be active at a time.
pub struct Fl2kDevice {
    pub(crate) ctx: Arc<Context>,
    pub(crate) handle: DeviceHandle,
    claimed_interface: i32,
    rate: f64,
    pub(crate) shared: Option<Box<Shared>>,
    pub(crate) usb_worker: Option<std::thread::JoinHandle<()>>,
    closed: bool,
}

impl Fl2kDevice {
    /// Open the `index`-th recognized device, claim its streaming
    /// interface, and run the boot register sequence.
    pub fn open(index: u32) -> Result<Fl2kDevice> {
        let ctx = Context::new()?;
        let list = ctx.device_list()?;

        let mut target: Option<usize> = None;
        let mut seen = 0u32;
        for i in 0..list.len() {
            if let Ok((vid, pid)) = list.descriptor(i) {
                if find_known_device(vid, pid).is_some() {
                    if seen == index {
                        target = Some(i);
                        break;
                    }
                    seen += 1;
                }
            }
        }

        let idx = target.ok_or(Fl2kError::NotFound)?;
        let handle = list.open(idx)?;
        drop(list);

        // The OEM adapter exposes an SPI flash for the Windows driver
        // installer as USB mass storage; the kernel's mass-storage driver
        // has to be detached from interface 3 before we can open the
        // vendor interface.
        if handle
            .kernel_driver_active(INTERFACE_MASS_STORAGE)
            .unwrap_or(false)
        {
            warn!("kernel mass storage driver attached, detaching (this may take a while)");
            handle.detach_kernel_driver(INTERFACE_MASS_STORAGE)?;
        }

        handle.claim_interface(0)?;
        let claimed_interface = match handle.set_interface_alt_setting(0, 1) {
            Ok(()) => 0,
            Err(_) => {
                warn!("failed to switch interface 0 to altsetting 1, trying interface 1");
                handle.claim_interface(1)?;
                1
            }
        };

        init_device(&handle)?;

        info!("opened device {index}");

        Ok(Fl2kDevice {
            ctx: Arc::new(ctx),
            handle,
            claimed_interface,
            rate: 0.0,
            shared: None,
            usb_worker: None,
            closed: false,
        })
    }

    /// Plan and program the sample clock, returning the realized frequency.
    pub fn set_sample_rate(&mut self, target_hz: u32) -> Result<f64> {
        let rate = crate::pll::set_sample_rate(&self.handle, target_hz)?;
        self.rate = rate;
        Ok(rate)
    }

    pub fn sample_rate(&self) -> f64 {
        self.rate
    }

    /// Read the 4-byte payload register at `reg_addr` over the I2C bridge.
    pub fn i2c_read(&self, i2c_addr: u8, reg_addr: u8) -> Result<[u8; 4]> {
        crate::i2c::i2c_read(&self.handle, i2c_addr, reg_addr)
    }

    /// Write the 4-byte payload register at `reg_addr` over the I2C bridge.
    pub fn i2c_write(&self, i2c_addr: u8, reg_addr: u8, data: [u8; 4]) -> Result<()> {
        crate::i2c::i2c_write(&self.handle, i2c_addr, reg_addr, data)
    }

    /// Whether the underlying device was observed to have disappeared
    /// (unplugged) during streaming.
    pub fn is_lost(&self) -> bool {
        self.shared.as_ref().map(|s| s.dev_lost()).unwrap_or(false)
    }

    /// Block until any in-flight streaming session has fully wound down,
    /// then release the interface and drop the libusb handle/context.
    /// Idempotent: a second call is a no-op, since `Drop` always calls this
    /// after a caller's own explicit `close()`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        let dev_lost = self.is_lost();

        if !dev_lost {
            if let Some(shared) = &self.shared {
                while shared.async_status() != AsyncStatus::Inactive {
                    sleep(Duration::from_millis(100));
                }
            }
            deinit_device(&self.handle);
        }

        if let Some(worker) = self.usb_worker.take() {
            let _ = worker.join();
        }

        self.handle.release_interface(self.claimed_interface)?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Fl2kDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error while closing device: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_devices_table_matches_the_oem_adapter() {
        assert_eq!(KNOWN_DEVICES.len(), 1);
        assert_eq!(KNOWN_DEVICES[0].vid, 0x1d5c);
        assert_eq!(KNOWN_DEVICES[0].pid, 0x2000);
    }

    #[test]
    fn find_known_device_rejects_unrelated_ids() {
        assert!(find_known_device(0x1d5c, 0x2000).is_some());
        assert!(find_known_device(0x1d5c, 0x9999).is_none());
        assert!(find_known_device(0x0000, 0x0000).is_none());
    }
}
