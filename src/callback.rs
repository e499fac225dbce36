//! The per-invocation data block handed to the application's sample
//! callback. Mirrors `fl2k_data_info_t` in `osmo-fl2k.h`, with one
//! deliberate simplification: the original's `void *ctx` + C function
//! pointer pair becomes a plain Rust closure that captures its own state,
//! so there is no `ctx` field here (see DESIGN.md).

/// Library-populated fields are set before the callback runs; the
/// application fills in the three lane slices (and their signedness) during
/// the callback and must not retain the pointers past its return — the
/// engine copies the bytes out before the callback returns.
pub struct Fl2kDataInfo<'a> {
    /// Underflow count observed so far this session (not just since the
    /// previous call — see spec.md §3, the counter is cumulative).
    pub underflow_cnt: u32,
    /// Length in bytes of each per-lane sample buffer the application may
    /// provide (`FL2K_BUF_LEN`).
    pub len: u32,
    /// Whether the ring is currently using kernel zero-copy DMA buffers.
    pub using_zerocopy: bool,
    /// Set on the final callback invocation after the device has been lost;
    /// the application should tear down.
    pub device_error: bool,

    /// Application-populated: sample buffers for each lane, or `None` to
    /// contribute nothing on this lane for this invocation.
    pub r_buf: Option<&'a [u8]>,
    pub g_buf: Option<&'a [u8]>,
    pub b_buf: Option<&'a [u8]>,

    /// Application-populated: whether the corresponding lane's samples are
    /// signed twos-complement (vs. unsigned).
    pub r_signed: bool,
    pub g_signed: bool,
    pub b_signed: bool,
}

impl<'a> Fl2kDataInfo<'a> {
    pub(crate) fn fresh(len: u32, underflow_cnt: u32, using_zerocopy: bool) -> Self {
        Fl2kDataInfo {
            underflow_cnt,
            len,
            using_zerocopy,
            device_error: false,
            r_buf: None,
            g_buf: None,
            b_buf: None,
            r_signed: false,
            g_signed: false,
            b_signed: false,
        }
    }

    pub(crate) fn device_error(using_zerocopy: bool) -> Self {
        Fl2kDataInfo {
            underflow_cnt: 0,
            len: 0,
            using_zerocopy,
            device_error: true,
            r_buf: None,
            g_buf: None,
            b_buf: None,
            r_signed: false,
            g_signed: false,
            b_signed: false,
        }
    }
}

/// The application-supplied sample callback. Boxed once at `start_tx` time
/// and run exclusively on the sample-worker thread. Higher-ranked over the
/// data block's lifetime since a fresh `Fl2kDataInfo` borrow is handed in on
/// every invocation.
pub type Fl2kCallback = Box<dyn FnMut(&mut Fl2kDataInfo<'_>) + Send + 'static>;
