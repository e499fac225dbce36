//! Minimal smoke test: open the first recognized adapter, program a sample
//! rate, stream a few seconds of dithered gray noise on all three lanes,
//! then stop cleanly. Not a general-purpose front end — no file input, no
//! resampling, no waveform generation; those remain external collaborators'
//! job (see `DESIGN.md`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Context};
use rand::Rng;

use fl2k::callback::Fl2kDataInfo;
use fl2k::device::Fl2kDevice;
use fl2k::ring::FL2K_BUF_LEN;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let count = fl2k::device_count().context("enumerating devices")?;
    if count == 0 {
        bail!("no FL2000-class device found");
    }

    let mut dev = Fl2kDevice::open(0).context("opening device 0")?;
    let rate = dev.set_sample_rate(48_000).context("programming sample rate")?;
    log::info!("streaming at {rate:.1} Hz");

    let emitted = Arc::new(AtomicU64::new(0));
    let emitted_cb = Arc::clone(&emitted);

    let mut noise = vec![0u8; FL2K_BUF_LEN];
    let mut rng = rand::rng();

    dev.start_tx(
        Box::new(move |info: &mut Fl2kDataInfo| {
            rng.fill(&mut noise[..]);
            info.r_buf = Some(&noise);
            info.g_buf = Some(&noise);
            info.b_buf = Some(&noise);
            emitted_cb.fetch_add(1, Ordering::Relaxed);
        }),
        0,
    )
    .context("starting stream")?;

    sleep(Duration::from_secs(3));

    dev.stop_tx().context("stopping stream")?;
    dev.close().context("closing device")?;

    log::info!("emitted {} buffers", emitted.load(Ordering::Relaxed));
    Ok(())
}
