//! Userspace streaming driver for FL2000-class USB-to-VGA DAC adapters.
//!
//! This crate turns a USB-attached FL2000 adapter into a three-channel
//! 8-bit DAC: open a device, plan a pixel clock, and stream converted
//! sample buffers through a small ring of in-flight USB transfers. It does
//! not generate, resample or otherwise produce samples — callers provide
//! raw 8-bit lane data through the [`Fl2kCallback`] passed to
//! [`Fl2kDevice::start_tx`].
//!
//! ```no_run
//! use fl2k::{device::Fl2kDevice, callback::Fl2kDataInfo};
//!
//! # fn main() -> fl2k::error::Result<()> {
//! let mut dev = Fl2kDevice::open(0)?;
//! dev.set_sample_rate(48_000)?;
//! dev.start_tx(Box::new(|info: &mut Fl2kDataInfo| {
//!     // populate info.r_buf / g_buf / b_buf here
//! }), 0)?;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod convert;
pub mod device;
pub mod error;
pub mod i2c;
pub mod pll;
pub mod regs;
pub mod ring;
mod stream;
pub mod usb;

pub use callback::{Fl2kCallback, Fl2kDataInfo};
pub use device::{device_count, device_name, enumerate, DeviceInfo, Fl2kDevice};
pub use error::{Fl2kError, Result};
pub use ring::{FL2K_BUF_LEN, FL2K_XFER_LEN, USB_REQUEST_LEN};
pub use stream::AsyncStatus;
