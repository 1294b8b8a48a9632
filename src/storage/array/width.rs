//! Element packing at 0, 1, 2, 4, 8, 16, 32 and 64 bits.
//!
//! Sub-byte widths hold unsigned values packed from the low bit of each byte
//! upwards. Byte widths hold signed little-endian integers.

/// Smallest width able to hold `v`.
pub fn bit_width(v: i64) -> u8 {
    if (v as u64) >> 4 == 0 {
        const SMALL: [u8; 16] = [0, 1, 2, 2, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4];
        return SMALL[v as usize];
    }
    if v == v as i8 as i64 {
        8
    } else if v == v as i16 as i64 {
        16
    } else if v == v as i32 as i64 {
        32
    } else {
        64
    }
}

/// Inclusive value range representable at `width`.
pub fn width_range(width: u8) -> (i64, i64) {
    match width {
        0 => (0, 0),
        1 => (0, 1),
        2 => (0, 3),
        4 => (0, 15),
        8 => (i8::MIN as i64, i8::MAX as i64),
        16 => (i16::MIN as i64, i16::MAX as i64),
        32 => (i32::MIN as i64, i32::MAX as i64),
        _ => (i64::MIN, i64::MAX),
    }
}

/// Reads element `ndx` from a payload packed at `width`.
#[inline]
pub fn get(data: &[u8], width: u8, ndx: usize) -> i64 {
    match width {
        0 => 0,
        1 | 2 | 4 => {
            let bit = ndx * width as usize;
            let mask = (1u8 << width) - 1;
            ((data[bit >> 3] >> (bit & 7)) & mask) as i64
        }
        8 => data[ndx] as i8 as i64,
        16 => i16::from_le_bytes([data[2 * ndx], data[2 * ndx + 1]]) as i64,
        32 => {
            let at = 4 * ndx;
            i32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as i64
        }
        64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[8 * ndx..8 * ndx + 8]);
            i64::from_le_bytes(raw)
        }
        _ => unreachable!("invalid element width {width}"),
    }
}

/// Writes element `ndx`; `v` must fit in `width`.
#[inline]
pub fn set(data: &mut [u8], width: u8, ndx: usize, v: i64) {
    debug_assert!(bit_width(v) <= width, "value {v} does not fit in {width} bits");
    match width {
        0 => {}
        1 | 2 | 4 => {
            let bit = ndx * width as usize;
            let shift = bit & 7;
            let mask = ((1u8 << width) - 1) << shift;
            let byte = &mut data[bit >> 3];
            *byte = (*byte & !mask) | (((v as u8) << shift) & mask);
        }
        8 => data[ndx] = v as i8 as u8,
        16 => data[2 * ndx..2 * ndx + 2].copy_from_slice(&(v as i16).to_le_bytes()),
        32 => data[4 * ndx..4 * ndx + 4].copy_from_slice(&(v as i32).to_le_bytes()),
        64 => data[8 * ndx..8 * ndx + 8].copy_from_slice(&v.to_le_bytes()),
        _ => unreachable!("invalid element width {width}"),
    }
}

/// Packs `values` into a fresh payload buffer of exactly the needed length.
pub fn encode(values: &[i64], width: u8) -> Vec<u8> {
    let mut out = vec![0u8; (values.len() * width as usize).div_ceil(8)];
    for (ndx, v) in values.iter().enumerate() {
        set(&mut out, width, ndx, *v);
    }
    out
}

/// Visits elements `begin..end` in order until `f` returns false.
///
/// Byte widths decode straight from fixed-size chunks instead of going
/// through [`get`].
pub fn scan<F>(data: &[u8], width: u8, begin: usize, end: usize, mut f: F)
where
    F: FnMut(usize, i64) -> bool,
{
    match width {
        8 => {
            for (i, b) in data[begin..end].iter().enumerate() {
                if !f(begin + i, *b as i8 as i64) {
                    return;
                }
            }
        }
        16 => {
            for (i, c) in data[2 * begin..2 * end].chunks_exact(2).enumerate() {
                if !f(begin + i, i16::from_le_bytes([c[0], c[1]]) as i64) {
                    return;
                }
            }
        }
        32 => {
            for (i, c) in data[4 * begin..4 * end].chunks_exact(4).enumerate() {
                if !f(begin + i, i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64) {
                    return;
                }
            }
        }
        64 => {
            for (i, c) in data[8 * begin..8 * end].chunks_exact(8).enumerate() {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                if !f(begin + i, i64::from_le_bytes(raw)) {
                    return;
                }
            }
        }
        _ => {
            for ndx in begin..end {
                if !f(ndx, get(data, width, ndx)) {
                    return;
                }
            }
        }
    }
}
