//! Slice color bit and its redundant wire encoding.
//!
//! Every slice owns one logical color bit that flips on each command that
//! addresses the slice. Responses carry that bit replicated over 8 wire
//! bits; the number of disagreeing copies tells the host whether the
//! response is fresh and whether the slice saw a decode error, a collision,
//! or both.
//!
//! ```text
//! distance from expected | class
//! -----------------------+-----------------------
//!           0            | clean
//!           1            | decode error
//!           2            | collision
//!           3            | decode error + collision
//!          4..=8         | not settled yet (retry)
//! ```
//!
//! With expected color 0 the distance is `popcount(code)`; with expected
//! color 1 it is `8 - popcount(code)`.

/// Result of classifying a color code against the expected color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorClass {
    /// Fresh response, no fault.
    Clean,
    /// Fresh response, slice reported a decode error.
    Decode,
    /// Fresh response, slice reported a collision.
    Collide,
    /// Fresh response, both faults.
    DecodeCollide,
    /// Stale response; read again.
    Unsettled,
}

impl ColorClass {
    /// The response can be trusted (possibly with recorded faults).
    #[must_use]
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::Unsettled)
    }

    /// A decode error was detected.
    #[must_use]
    pub const fn decode(self) -> bool {
        matches!(self, Self::Decode | Self::DecodeCollide)
    }

    /// A collision was detected.
    #[must_use]
    pub const fn collide(self) -> bool {
        matches!(self, Self::Collide | Self::DecodeCollide)
    }
}

/// Classify a response color code against the expected color.
#[must_use]
pub const fn classify(code: u8, expected: bool) -> ColorClass {
    let ones = code.count_ones();
    let distance = if expected { 8 - ones } else { ones };
    match distance {
        0 => ColorClass::Clean,
        1 => ColorClass::Decode,
        2 => ColorClass::Collide,
        3 => ColorClass::DecodeCollide,
        _ => ColorClass::Unsettled,
    }
}

/// Clean wire encoding of a color bit.
#[must_use]
pub const fn encode(color: bool) -> u8 {
    if color {
        0xFF
    } else {
        0x00
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn table_for_expected_zero() {
        assert_eq!(classify(0x00, false), ColorClass::Clean);
        assert_eq!(classify(0x01, false), ColorClass::Decode);
        assert_eq!(classify(0x03, false), ColorClass::Collide);
        assert_eq!(classify(0x07, false), ColorClass::DecodeCollide);
        assert_eq!(classify(0x0F, false), ColorClass::Unsettled);
        assert_eq!(classify(0xFF, false), ColorClass::Unsettled);
    }

    #[test]
    fn table_for_expected_one() {
        assert_eq!(classify(0xFF, true), ColorClass::Clean);
        assert_eq!(classify(0xFE, true), ColorClass::Decode);
        assert_eq!(classify(0xFC, true), ColorClass::Collide);
        assert_eq!(classify(0xF8, true), ColorClass::DecodeCollide);
        assert_eq!(classify(0xF0, true), ColorClass::Unsettled);
        assert_eq!(classify(0x00, true), ColorClass::Unsettled);
    }

    #[test]
    fn clean_encoding_classifies_clean() {
        assert_eq!(classify(encode(false), false), ColorClass::Clean);
        assert_eq!(classify(encode(true), true), ColorClass::Clean);
    }

    proptest! {
        #[test]
        fn classification_depends_only_on_distance(code in any::<u8>(), expected in any::<bool>()) {
            let ones = code.count_ones();
            let distance = if expected { 8 - ones } else { ones };
            let class = classify(code, expected);
            prop_assert_eq!(class.is_settled(), distance <= 3);
            prop_assert_eq!(class.decode(), distance == 1 || distance == 3);
            prop_assert_eq!(class.collide(), distance == 2 || distance == 3);
        }

        #[test]
        fn complement_mirrors_expected_color(code in any::<u8>()) {
            prop_assert_eq!(classify(code, false), classify(!code, true));
        }
    }
}
