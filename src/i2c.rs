//! I2C bridge over the register gateway: the FL2000 has no dedicated I2C
//! endpoint, so a read or write is submitted by poking control register
//! `0x8020` and polling it until the device reports completion. Grounded on
//! `fl2k_i2c_read`/`fl2k_i2c_write` in `libosmo-fl2k.c`.

use std::thread::sleep;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Fl2kError, Result};
use crate::regs::{read_reg, write_reg};
use crate::usb::DeviceHandle;

const REG_I2C_CTRL: u16 = 0x8020;
const REG_I2C_READ_DATA: u16 = 0x8024;
const REG_I2C_WRITE_DATA: u16 = 0x8028;

const POLL_ATTEMPTS: u32 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

bitflags! {
    /// Control/status bits of register `0x8020`, the hardware I2C master's
    /// trigger register. Fields not named here (the register address and
    /// slave address packed into the middle bits) are plain shifts, not
    /// flags, so they stay outside this bitset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct I2cCtrl: u32 {
        /// Request is a read (vs. write) when set.
        const READ = 1 << 7;
        /// Must be set on every trigger write or the master ignores it.
        const ENABLE = 1 << 28;
        /// Set by the device once the transaction has completed.
        const DONE = 1 << 31;
        /// Slave NACK / bus-error nibble; non-zero means no such slave.
        const NACK = 0x0f << 24;
    }
}

/// Bits preserved across a read-modify-write of the control register:
/// everything outside the fields this module drives.
const MASK_KEEP: u32 = 0x3ffc0000;

fn poll_until_done(handle: &DeviceHandle) -> Result<u32> {
    for _ in 0..POLL_ATTEMPTS {
        sleep(POLL_INTERVAL);
        let reg = read_reg(handle, REG_I2C_CTRL)?;
        let ctrl = I2cCtrl::from_bits_truncate(reg);
        if ctrl.contains(I2cCtrl::DONE) {
            if ctrl.intersects(I2cCtrl::NACK) {
                return Err(Fl2kError::NotFound);
            }
            return Ok(reg);
        }
    }
    Err(Fl2kError::Timeout)
}

/// Read the 4-byte payload register at `reg_addr` on the device at
/// `i2c_addr` (7-bit slave address). Only the low byte is a genuine I2C
/// payload byte on most attached peripherals (e.g. an EDID EEPROM); the
/// other three mirror the original's raw register width.
pub fn i2c_read(handle: &DeviceHandle, i2c_addr: u8, reg_addr: u8) -> Result<[u8; 4]> {
    let mut ctrl = read_reg(handle, REG_I2C_CTRL)? & MASK_KEEP;
    ctrl |= (I2cCtrl::ENABLE | I2cCtrl::READ).bits();
    ctrl |= ((reg_addr as u32) << 8) | (i2c_addr as u32 & 0x7f);
    write_reg(handle, REG_I2C_CTRL, ctrl)?;

    poll_until_done(handle)?;

    Ok(read_reg(handle, REG_I2C_READ_DATA)?.to_le_bytes())
}

/// Write `data` to `reg_addr` on the device at `i2c_addr` (7-bit).
pub fn i2c_write(handle: &DeviceHandle, i2c_addr: u8, reg_addr: u8, data: [u8; 4]) -> Result<()> {
    write_reg(handle, REG_I2C_WRITE_DATA, u32::from_le_bytes(data))?;

    let mut ctrl = read_reg(handle, REG_I2C_CTRL)? & MASK_KEEP;
    ctrl |= I2cCtrl::ENABLE.bits();
    ctrl |= ((reg_addr as u32) << 8) | (i2c_addr as u32 & 0x7f);
    write_reg(handle, REG_I2C_CTRL, ctrl)?;

    poll_until_done(handle)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_sets_read_bit_and_clears_repeat_bit() {
        let reg_addr: u8 = 0x12;
        let i2c_addr: u8 = 0x50;
        let ctrl = (I2cCtrl::ENABLE | I2cCtrl::READ).bits()
            | ((reg_addr as u32) << 8)
            | (i2c_addr as u32 & 0x7f);
        assert!(I2cCtrl::from_bits_truncate(ctrl).contains(I2cCtrl::READ));
        assert_eq!((ctrl >> 8) & 0xff, reg_addr as u32);
        assert_eq!(ctrl & 0x7f, i2c_addr as u32);
    }

    #[test]
    fn write_request_never_sets_read_bit() {
        let reg_addr: u8 = 0x03;
        let i2c_addr: u8 = 0x40;
        let ctrl = I2cCtrl::ENABLE.bits() | ((reg_addr as u32) << 8) | (i2c_addr as u32 & 0x7f);
        assert!(!I2cCtrl::from_bits_truncate(ctrl).contains(I2cCtrl::READ));
    }

    #[test]
    fn nack_mask_detects_slave_not_responding() {
        let reg_done_nack = I2cCtrl::DONE.bits() | (0x1 << 24);
        assert!(I2cCtrl::from_bits_truncate(reg_done_nack).intersects(I2cCtrl::NACK));
        let reg_done_ack = I2cCtrl::DONE.bits();
        assert!(!I2cCtrl::from_bits_truncate(reg_done_ack).intersects(I2cCtrl::NACK));
    }
}
