//! Quarantine id generation and validation.
//!
//! An id is exactly 21 ASCII bytes: `YYYYMMDD_HHMMSS_xxxxxx`, where `x` is
//! lowercase hex. Any string that does not match is rejected at every API
//! boundary.

use chrono::Utc;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;

pub const ID_LEN: usize = 21;

lazy_static! {
    static ref ID_PATTERN: Regex =
        Regex::new(r"^[0-9]{8}_[0-9]{6}_[0-9a-f]{6}$").expect("id pattern is valid");
}

/// True iff `candidate` matches the 21-byte id grammar exactly.
pub fn is_valid_id(candidate: &str) -> bool {
    candidate.len() == ID_LEN && ID_PATTERN.is_match(candidate)
}

/// Generate a fresh id from the current UTC time and six random hex digits.
pub fn generate_id() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).expect("digit in radix"))
        .collect();
    format!("{stamp}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..64 {
            let id = generate_id();
            assert!(is_valid_id(&id), "generated id {id:?} failed its own grammar");
        }
    }

    #[test]
    fn grammar_rejects_near_misses() {
        assert!(is_valid_id("20250115_093042_a1b2c3"));
        // Wrong length.
        assert!(!is_valid_id("20250115_093042_a1b2c"));
        assert!(!is_valid_id("20250115_093042_a1b2c34"));
        assert!(!is_valid_id(""));
        // Non-digit in the date.
        assert!(!is_valid_id("2025011x_093042_a1b2c3"));
        // Wrong separators.
        assert!(!is_valid_id("20250115-093042_a1b2c3"));
        assert!(!is_valid_id("20250115_093042-a1b2c3"));
        // Uppercase or non-hex suffix.
        assert!(!is_valid_id("20250115_093042_A1B2C3"));
        assert!(!is_valid_id("20250115_093042_g1b2c3"));
        // Path metacharacters never validate.
        assert!(!is_valid_id("../../../../etc/passwd"));
    }

    proptest! {
        #[test]
        fn arbitrary_strings_only_validate_on_exact_grammar(s in "\\PC{0,32}") {
            let by_hand = s.len() == ID_LEN
                && s.bytes().enumerate().all(|(i, b)| match i {
                    8 | 15 => b == b'_',
                    0..=7 | 9..=14 => b.is_ascii_digit(),
                    _ => b.is_ascii_digit() || (b'a'..=b'f').contains(&b),
                });
            prop_assert_eq!(is_valid_id(&s), by_hand);
        }
    }
}
