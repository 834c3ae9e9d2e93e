//! Little-endian bit-field access over fixed byte buffers
//!
//! Bit `i` of a field starting at `start` lives in byte `(start + i) / 8`, bit
//! `(start + i) % 8`. This is the layout used by every CAN payload in the charger
//! message set, so a field can straddle byte boundaries freely.
//!
//! Out-of-range access panics with an index fault; payload buffers are always the
//! fixed 8-byte CAN data field.

/// Read `len` bits starting at bit `start`
///
/// Fields up to 64 bits wide are supported.
///
/// ```rust
/// use voltage_chargebus::bitfield;
///
/// let buf = [0x34, 0x12, 0, 0, 0, 0, 0, 0];
/// assert_eq!(bitfield::get(&buf, 0, 16), 0x1234);
/// assert_eq!(bitfield::get(&buf, 4, 8), 0x23);
/// ```
pub fn get(buf: &[u8], start: usize, len: usize) -> u64 {
    debug_assert!(len <= 64, "bit field wider than 64 bits");
    let mut value = 0u64;
    for i in 0..len {
        let bit = start + i;
        if (buf[bit / 8] >> (bit % 8)) & 1 == 1 {
            value |= 1u64 << i;
        }
    }
    value
}

/// Write the low `len` bits of `value` starting at bit `start`
///
/// Affected bits are cleared first; bits of `value` above `len` are dropped.
/// Bits outside `[start, start + len)` are never touched.
pub fn set(buf: &mut [u8], start: usize, len: usize, value: u64) {
    debug_assert!(len <= 64, "bit field wider than 64 bits");
    for i in 0..len {
        let bit = start + i;
        let mask = 1u8 << (bit % 8);
        if (value >> i) & 1 == 1 {
            buf[bit / 8] |= mask;
        } else {
            buf[bit / 8] &= !mask;
        }
    }
}

/// Single-bit read
pub fn flag(buf: &[u8], bit: usize) -> bool {
    get(buf, bit, 1) == 1
}

/// Single-bit write
pub fn set_flag(buf: &mut [u8], bit: usize, on: bool) {
    set(buf, bit, 1, on as u64);
}

/// Read a two's-complement signed field of `len` bits
pub fn get_signed(buf: &[u8], start: usize, len: usize) -> i64 {
    let raw = get(buf, start, len);
    if len == 0 || len >= 64 {
        return raw as i64;
    }
    let shift = 64 - len;
    ((raw << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic value generator so the round trip covers many bit patterns
    fn patterns() -> impl Iterator<Item = u64> {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        std::iter::repeat_with(move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        })
    }

    #[test]
    fn test_round_trip_leaves_other_bits() {
        let mut values = patterns();
        for len in 1..=57usize {
            for start in 0..=(64 - len) {
                let background = values.next().unwrap_or(0);
                let mut buf = background.to_le_bytes();
                let mask = if len == 64 { u64::MAX } else { (1u64 << len) - 1 };
                let value = values.next().unwrap_or(0) & mask;

                set(&mut buf, start, len, value);
                assert_eq!(get(&buf, start, len), value, "start={} len={}", start, len);

                let outside = !(mask << start);
                assert_eq!(
                    u64::from_le_bytes(buf) & outside,
                    background & outside,
                    "outside bits changed at start={} len={}",
                    start,
                    len
                );
            }
        }
    }

    #[test]
    fn test_set_truncates_wide_values() {
        let mut buf = [0u8; 8];
        set(&mut buf, 4, 4, 0xFF);
        assert_eq!(buf[0], 0xF0);
        assert_eq!(buf[1], 0x00);
    }

    #[test]
    fn test_full_width_field() {
        let mut buf = [0u8; 8];
        set(&mut buf, 0, 64, u64::MAX - 1);
        assert_eq!(get(&buf, 0, 64), u64::MAX - 1);
    }

    #[test]
    fn test_signed_field() {
        let mut buf = [0u8; 8];
        set(&mut buf, 16, 16, (-200i16) as u16 as u64);
        assert_eq!(get_signed(&buf, 16, 16), -200);
        set(&mut buf, 0, 8, 0x7F);
        assert_eq!(get_signed(&buf, 0, 8), 127);
    }

    #[test]
    fn test_flags() {
        let mut buf = [0u8; 8];
        set_flag(&mut buf, 39, true);
        assert_eq!(buf[4], 0x80);
        assert!(flag(&buf, 39));
        set_flag(&mut buf, 39, false);
        assert!(!flag(&buf, 39));
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_panics() {
        let buf = [0u8; 8];
        get(&buf, 60, 8);
    }
}
