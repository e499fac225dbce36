//! Register gateway: 32-bit little-endian reads/writes over the control
//! endpoint. Pure RPC, no retry, no caching. Grounded on `fl2k_read_reg` /
//! `fl2k_write_reg` in `libosmo-fl2k.c`.

use log::warn;

use crate::error::Result;
use crate::usb::DeviceHandle;

const REQ_READ: u8 = 0x40;
const REQ_WRITE: u8 = 0x41;

/// Read a 32-bit register. A short read (fewer than 4 bytes back) is logged
/// but the (possibly incomplete) value is still returned, matching the
/// original's "short reads are logged but returned" behaviour.
pub fn read_reg(handle: &DeviceHandle, reg: u16) -> Result<u32> {
    let mut data = [0u8; 4];
    let n = handle.control_in(REQ_READ, 0, reg, &mut data)?;
    if n < 4 {
        warn!("short read from register 0x{reg:04x}: got {n} of 4 bytes");
    }
    Ok(u32::from_le_bytes(data))
}

/// Write a 32-bit register.
pub fn write_reg(handle: &DeviceHandle, reg: u16, val: u32) -> Result<()> {
    let mut data = val.to_le_bytes();
    handle.control_out(REQ_WRITE, 0, reg, &mut data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_value_round_trips_through_little_endian_bytes() {
        let val: u32 = 0x00416f3f;
        let bytes = val.to_le_bytes();
        assert_eq!(bytes, [0x3f, 0x6f, 0x41, 0x00]);
        assert_eq!(u32::from_le_bytes(bytes), val);
    }
}
