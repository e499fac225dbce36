//! Error type for the crate's public operations.
//!
//! The original C library returns small negative `int` codes
//! (`FL2K_ERROR_*` in `osmo-fl2k.h`) or passes through whatever `libusb`
//! returned. We keep the same numeric space for callers that want it
//! (`From<Fl2kError> for i32`) but expose a typed enum everywhere internally.

use std::fmt;

pub type Result<T> = std::result::Result<T, Fl2kError>;

#[derive(Debug, thiserror::Error)]
pub enum Fl2kError {
    #[error("invalid parameter")]
    InvalidParam,

    #[error("no device")]
    NoDevice,

    #[error("no matching device found")]
    NotFound,

    #[error("device busy")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("out of memory")]
    NoMem,

    #[error("libusb error {0}: {1}")]
    Usb(i32, UsbErrorName),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wraps a raw libusb error code purely so `Fl2kError::Usb` has a readable
/// `Display` impl without needing a dependency on libusb's own string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbErrorName(pub i32);

impl fmt::Display for UsbErrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0 => "SUCCESS",
            -1 => "IO",
            -2 => "INVALID_PARAM",
            -3 => "ACCESS",
            -4 => "NO_DEVICE",
            -5 => "NOT_FOUND",
            -6 => "BUSY",
            -7 => "TIMEOUT",
            -8 => "OVERFLOW",
            -9 => "PIPE",
            -10 => "INTERRUPTED",
            -11 => "NO_MEM",
            -12 => "NOT_SUPPORTED",
            _ => "OTHER",
        };
        write!(f, "LIBUSB_ERROR_{name}")
    }
}

impl Fl2kError {
    /// Wrap a raw return code from a `libusb_*` call that failed (`< 0`).
    pub fn from_usb_rc(rc: i32) -> Self {
        match rc {
            -4 => Fl2kError::NoDevice,
            -5 => Fl2kError::NotFound,
            -7 => Fl2kError::Timeout,
            -11 => Fl2kError::NoMem,
            other => Fl2kError::Usb(other, UsbErrorName(other)),
        }
    }
}

impl From<Fl2kError> for i32 {
    fn from(e: Fl2kError) -> i32 {
        match e {
            Fl2kError::InvalidParam => -1,
            Fl2kError::NoDevice => -2,
            Fl2kError::NotFound => -5,
            Fl2kError::Busy => -6,
            Fl2kError::Timeout => -7,
            Fl2kError::NoMem => -11,
            Fl2kError::Usb(rc, _) => rc,
            Fl2kError::Io(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_the_original_numbering() {
        assert_eq!(i32::from(Fl2kError::InvalidParam), -1);
        assert_eq!(i32::from(Fl2kError::NoDevice), -2);
        assert_eq!(i32::from(Fl2kError::NotFound), -5);
        assert_eq!(i32::from(Fl2kError::Busy), -6);
        assert_eq!(i32::from(Fl2kError::Timeout), -7);
        assert_eq!(i32::from(Fl2kError::NoMem), -11);
    }

    #[test]
    fn from_usb_rc_maps_known_codes() {
        assert!(matches!(Fl2kError::from_usb_rc(-4), Fl2kError::NoDevice));
        assert!(matches!(Fl2kError::from_usb_rc(-5), Fl2kError::NotFound));
        assert!(matches!(Fl2kError::from_usb_rc(-7), Fl2kError::Timeout));
        assert!(matches!(Fl2kError::from_usb_rc(-11), Fl2kError::NoMem));
        assert!(matches!(Fl2kError::from_usb_rc(-9), Fl2kError::Usb(-9, _)));
    }
}
