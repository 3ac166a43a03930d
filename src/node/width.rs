//! Element widths and the promotion rules between them.

/// Bits per element in a node payload.
///
/// The header encodes a width as a 3-bit code: 0 for the zero width, and
/// `log2(w) + 1` for the seven real widths. Widths 1, 2 and 4 hold
/// zero-extended non-negative values; 8, 16, 32 and 64 are sign-extended
/// two's complement.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Width {
    W0,
    W1,
    W2,
    W4,
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bits(self) -> usize {
        match self {
            Width::W0 => 0,
            Width::W1 => 1,
            Width::W2 => 2,
            Width::W4 => 4,
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Width::W0 => 0,
            Width::W1 => 1,
            Width::W2 => 2,
            Width::W4 => 3,
            Width::W8 => 4,
            Width::W16 => 5,
            Width::W32 => 6,
            Width::W64 => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Width> {
        match code {
            0 => Some(Width::W0),
            1 => Some(Width::W1),
            2 => Some(Width::W2),
            3 => Some(Width::W4),
            4 => Some(Width::W8),
            5 => Some(Width::W16),
            6 => Some(Width::W32),
            7 => Some(Width::W64),
            _ => None,
        }
    }

    /// The minimal width that holds `v`. Negative values never fit a
    /// sub-byte width.
    pub fn for_value(v: i64) -> Width {
        if v == 0 {
            Width::W0
        } else if v == 1 {
            Width::W1
        } else if (0..4).contains(&v) {
            Width::W2
        } else if (0..16).contains(&v) {
            Width::W4
        } else if (-0x80..0x80).contains(&v) {
            Width::W8
        } else if (-0x8000..0x8000).contains(&v) {
            Width::W16
        } else if (-0x8000_0000..0x8000_0000).contains(&v) {
            Width::W32
        } else {
            Width::W64
        }
    }

    /// Payload bytes needed for `count` elements at this width.
    pub fn byte_len(self, count: usize) -> usize {
        match self {
            Width::W0 => 0,
            Width::W1 => count.div_ceil(8),
            Width::W2 => count.div_ceil(4),
            Width::W4 => count.div_ceil(2),
            Width::W8 => count,
            Width::W16 => count * 2,
            Width::W32 => count * 4,
            Width::W64 => count * 8,
        }
    }

    /// Elements per 64-bit chunk, for the parallel scan paths. Zero for
    /// the zero width, which stores no payload at all.
    pub fn per_chunk(self) -> usize {
        match self {
            Width::W0 => 0,
            w => 64 / w.bits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_widths() {
        assert_eq!(Width::for_value(0), Width::W0);
        assert_eq!(Width::for_value(1), Width::W1);
        assert_eq!(Width::for_value(2), Width::W2);
        assert_eq!(Width::for_value(3), Width::W2);
        assert_eq!(Width::for_value(4), Width::W4);
        assert_eq!(Width::for_value(15), Width::W4);
        assert_eq!(Width::for_value(16), Width::W8);
        assert_eq!(Width::for_value(127), Width::W8);
        assert_eq!(Width::for_value(128), Width::W16);
        assert_eq!(Width::for_value(-1), Width::W8);
        assert_eq!(Width::for_value(-129), Width::W16);
        assert_eq!(Width::for_value(1 << 40), Width::W64);
        assert_eq!(Width::for_value(i64::MIN), Width::W64);
    }

    #[test]
    fn code_round_trip() {
        for w in [
            Width::W0,
            Width::W1,
            Width::W2,
            Width::W4,
            Width::W8,
            Width::W16,
            Width::W32,
            Width::W64,
        ] {
            assert_eq!(Width::from_code(w.code()), Some(w));
        }
        assert_eq!(Width::from_code(8), None);
    }

    #[test]
    fn byte_lengths() {
        assert_eq!(Width::W0.byte_len(100), 0);
        assert_eq!(Width::W1.byte_len(9), 2);
        assert_eq!(Width::W2.byte_len(5), 2);
        assert_eq!(Width::W4.byte_len(3), 2);
        assert_eq!(Width::W8.byte_len(7), 7);
        assert_eq!(Width::W64.byte_len(3), 24);
    }
}
