//! Per-lane byte-interleave conversion: scatters a linear 8-bit sample
//! buffer into the DAC's 24-byte "pixel group" layout.
//!
//! Grounded directly on `fl2k_convert_r`/`_g`/`_b` in `libosmo-fl2k.c`; the
//! byte offsets here are copied verbatim from that file (and match spec.md
//! §4.5.1's table).

/// Byte offset within a 24-byte output group that input sample `j`
/// (0-indexed within the group of 8) lands at, for each lane.
const R_OFFSETS: [usize; 8] = [6, 1, 12, 15, 10, 21, 16, 19];
const G_OFFSETS: [usize; 8] = [5, 0, 3, 14, 9, 20, 23, 18];
const B_OFFSETS: [usize; 8] = [4, 7, 2, 13, 8, 11, 22, 17];

const GROUP_OUT_LEN: usize = 24;
const GROUP_IN_LEN: usize = 8;

/// Bias added to every output byte for a lane whose samples are signed
/// twos-complement (converts to the unsigned offset-binary form the DAC
/// expects). `0` for unsigned lanes.
pub fn bias_for(signed: bool) -> u8 {
    if signed {
        128
    } else {
        0
    }
}

/// Scatter `input` into `out` at the given lane's offsets, `out.len()` must
/// be a multiple of 24. `input` is consumed 8 bytes per 24-byte output
/// group; if it runs short the remaining groups are left untouched (this
/// should not happen in practice since callers size both buffers from the
/// same `FL2K_BUF_LEN`/`FL2K_XFER_LEN` pair, but we never index out of
/// bounds). A `None` lane contributes nothing, matching spec.md §4.5.1's
/// "if a lane pointer is null, that lane contributes nothing".
fn convert_lane(out: &mut [u8], input: Option<&[u8]>, signed: bool, offsets: &[usize; 8]) {
    let Some(input) = input else {
        return;
    };
    let bias = bias_for(signed);

    let mut in_off = 0usize;
    for out_off in (0..out.len()).step_by(GROUP_OUT_LEN) {
        if in_off + GROUP_IN_LEN > input.len() {
            break;
        }
        for k in 0..GROUP_IN_LEN {
            out[out_off + offsets[k]] = input[in_off + k].wrapping_add(bias);
        }
        in_off += GROUP_IN_LEN;
    }
}

pub fn convert_r(out: &mut [u8], input: Option<&[u8]>, signed: bool) {
    convert_lane(out, input, signed, &R_OFFSETS);
}

pub fn convert_g(out: &mut [u8], input: Option<&[u8]>, signed: bool) {
    convert_lane(out, input, signed, &G_OFFSETS);
}

pub fn convert_b(out: &mut [u8], input: Option<&[u8]>, signed: bool) {
    convert_lane(out, input, signed, &B_OFFSETS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn lane_offsets_partition_one_pixel_group_exactly() {
        let mut seen: HashSet<usize> = HashSet::new();
        for off in R_OFFSETS.iter().chain(G_OFFSETS.iter()).chain(B_OFFSETS.iter()) {
            assert!(seen.insert(*off), "offset {off} claimed by more than one lane");
        }
        let expected: HashSet<usize> = (0..24).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn signed_zero_becomes_midpoint_0x80() {
        let mut out = [0u8; 24];
        let input = [0u8; 8];
        convert_r(&mut out, Some(&input), true);
        for off in R_OFFSETS {
            assert_eq!(out[off], 0x80);
        }
    }

    #[test]
    fn unsigned_samples_pass_through_unbiased() {
        let mut out = [0u8; 24];
        let input = [1, 2, 3, 4, 5, 6, 7, 8];
        convert_g(&mut out, Some(&input), false);
        for (k, off) in G_OFFSETS.iter().enumerate() {
            assert_eq!(out[*off], input[k]);
        }
    }

    #[test]
    fn null_lane_leaves_output_untouched() {
        let mut out = [0xAAu8; 24];
        convert_b(&mut out, None, true);
        assert_eq!(out, [0xAAu8; 24]);
    }

    #[test]
    fn all_three_lanes_together_cover_every_byte_of_a_group() {
        let mut out = [0u8; 24];
        let r = [10u8; 8];
        let g = [20u8; 8];
        let b = [30u8; 8];
        convert_r(&mut out, Some(&r), false);
        convert_g(&mut out, Some(&g), false);
        convert_b(&mut out, Some(&b), false);
        for off in R_OFFSETS {
            assert_eq!(out[off], 10);
        }
        for off in G_OFFSETS {
            assert_eq!(out[off], 20);
        }
        for off in B_OFFSETS {
            assert_eq!(out[off], 30);
        }
    }

    #[test]
    fn multiple_groups_advance_independently() {
        let mut out = [0u8; 48];
        let input: Vec<u8> = (0..16).collect();
        convert_r(&mut out, Some(&input), false);
        for off in R_OFFSETS {
            assert_eq!(out[off], input[R_OFFSETS.iter().position(|o| *o == off).unwrap()]);
            assert_eq!(
                out[24 + off],
                input[8 + R_OFFSETS.iter().position(|o| *o == off).unwrap()]
            );
        }
    }
}
