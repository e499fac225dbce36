//! End-to-end scenarios from spec.md §8 that need a physical FL2000-class
//! adapter attached. Gated behind the `hardware-tests` feature so a plain
//! `cargo test` stays green with no device present; run these with
//! `cargo test --features hardware-tests -- --ignored` on a machine with
//! real hardware.

#![cfg(feature = "hardware-tests")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use fl2k::callback::Fl2kDataInfo;
use fl2k::device::Fl2kDevice;
use fl2k::ring::FL2K_BUF_LEN;

fn open_first() -> Fl2kDevice {
    Fl2kDevice::open(0).expect("no FL2000-class device attached")
}

/// Scenario 1: constant midlevel output on all three lanes at 100 MHz for a
/// short run. Expect the realized rate within 1 Hz and zero underflows.
#[test]
#[ignore]
fn constant_output_at_100mhz_has_no_underflow() {
    let mut dev = open_first();
    let rate = dev.set_sample_rate(100_000_000).unwrap();
    assert!((rate - 100_000_000.0).abs() <= 1.0, "rate={rate}");

    let buf = vec![0x80u8; FL2K_BUF_LEN];
    dev.start_tx(
        Box::new(move |info: &mut Fl2kDataInfo| {
            info.r_buf = Some(&buf);
            info.g_buf = Some(&buf);
            info.b_buf = Some(&buf);
        }),
        0,
    )
    .unwrap();

    sleep(Duration::from_secs(10));

    dev.stop_tx().unwrap();
    dev.close().unwrap();
}

/// Scenario 2: drive only the R lane at the NTSC colorburst-derived rate;
/// the PLL planner should realize it within 1 Hz (it is directly
/// representable).
#[test]
#[ignore]
fn single_lane_drive_realizes_exact_colorburst_rate() {
    let mut dev = open_first();
    let rate = dev.set_sample_rate(14_318_181).unwrap();
    assert!((rate - 14_318_181.0).abs() <= 1.0, "rate={rate}");

    let r = vec![0xffu8; FL2K_BUF_LEN];
    dev.start_tx(
        Box::new(move |info: &mut Fl2kDataInfo| {
            info.r_buf = Some(&r);
        }),
        0,
    )
    .unwrap();

    sleep(Duration::from_secs(5));

    dev.stop_tx().unwrap();
    dev.close().unwrap();
}

/// Scenario 3: a callback that stalls for 250ms once should produce a
/// bounded number of underflow replays, observed on the next callback, and
/// streaming should resume without the ring corrupting FIFO order.
#[test]
#[ignore]
fn one_slow_callback_produces_bounded_underflow() {
    let mut dev = open_first();
    dev.set_sample_rate(48_000).unwrap();

    let invocation = Arc::new(AtomicU32::new(0));
    let seen_underflow = Arc::new(AtomicU32::new(0));
    let inv_cb = Arc::clone(&invocation);
    let underflow_cb = Arc::clone(&seen_underflow);

    let buf = vec![0x80u8; FL2K_BUF_LEN];
    dev.start_tx(
        Box::new(move |info: &mut Fl2kDataInfo| {
            let n = inv_cb.fetch_add(1, Ordering::SeqCst);
            if n == 5 {
                sleep(Duration::from_millis(250));
            }
            if n == 6 {
                underflow_cb.store(info.underflow_cnt, Ordering::SeqCst);
            }
            info.r_buf = Some(&buf);
            info.g_buf = Some(&buf);
            info.b_buf = Some(&buf);
        }),
        0,
    )
    .unwrap();

    sleep(Duration::from_secs(2));
    dev.stop_tx().unwrap();
    dev.close().unwrap();

    assert!(seen_underflow.load(Ordering::SeqCst) >= 1);
}

/// Scenario 5: an I2C read targeting a slave address with nothing attached
/// must fail with `NotFound` within the 10x10ms poll budget.
#[test]
#[ignore]
fn i2c_read_from_missing_slave_returns_not_found_quickly() {
    let dev = open_first();

    let start = Instant::now();
    let result = dev.i2c_read(0x7f, 0x00);
    let elapsed = start.elapsed();

    assert!(result.is_err());
    assert!(elapsed <= Duration::from_millis(150), "elapsed={elapsed:?}");
}

/// Scenario 4's close-blocks-until-inactive guarantee, without needing an
/// actual signal handler: stop_tx from the test thread, close from the same
/// thread, and assert close doesn't return until teardown is complete.
#[test]
#[ignore]
fn close_blocks_until_workers_exit() {
    let mut dev = open_first();
    dev.set_sample_rate(48_000).unwrap();

    let buf = vec![0x80u8; FL2K_BUF_LEN];
    dev.start_tx(
        Box::new(move |info: &mut Fl2kDataInfo| {
            info.r_buf = Some(&buf);
        }),
        0,
    )
    .unwrap();

    sleep(Duration::from_millis(500));
    dev.stop_tx().unwrap();

    let start = Instant::now();
    dev.close().unwrap();
    assert!(start.elapsed() <= Duration::from_secs(5));
}
