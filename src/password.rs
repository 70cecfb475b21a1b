//! Random passwords for providers that insist on a root or admin password.
//!
//! The host is only ever reached through the tunnel, so the password is
//! generated, handed to the provider, and then forgotten.

use rand::Rng;
use rand::seq::SliceRandom;

/// Length used when a provider has no stricter requirement.
pub const DEFAULT_LENGTH: usize = 64;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"~!@#$%^&*()_+-={}[]:<>?,./";

/// Generates a password of `len` characters (at least four).
///
/// The result always contains a lowercase letter, an uppercase letter, a
/// digit and a symbol, which satisfies the complexity rules of Azure and
/// Linode.
#[must_use]
pub fn generate(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let classes = [LOWER, UPPER, DIGITS, SYMBOLS];
    let mut chars: Vec<u8> = classes
        .iter()
        .filter_map(|class| class.choose(&mut rng).copied())
        .collect();
    let alphabet: Vec<u8> = classes.concat();
    while chars.len() < len {
        let index = rng.gen_range(0..alphabet.len());
        if let Some(byte) = alphabet.get(index) {
            chars.push(*byte);
        }
    }
    chars.shuffle(&mut rng);
    chars.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(4)]
    #[case(16)]
    #[case(DEFAULT_LENGTH)]
    fn contains_every_character_class(#[case] len: usize) {
        let password = generate(len);
        assert_eq!(password.len(), len);
        assert!(password.chars().any(|c| c.is_ascii_lowercase()));
        assert!(password.chars().any(|c| c.is_ascii_uppercase()));
        assert!(password.chars().any(|c| c.is_ascii_digit()));
        assert!(password.bytes().any(|b| SYMBOLS.contains(&b)));
    }

    #[rstest]
    fn short_lengths_still_meet_complexity() {
        assert_eq!(generate(1).len(), 4);
    }

    #[rstest]
    fn successive_passwords_differ() {
        assert_ne!(generate(DEFAULT_LENGTH), generate(DEFAULT_LENGTH));
    }
}
