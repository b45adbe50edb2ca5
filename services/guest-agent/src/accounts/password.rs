//! Local account password generation.

use rand::Rng;

const PASSWORD_LEN: usize = 15;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
// No quotes or non-ASCII: the password may be typed on a command line.
const SYMBOLS: &[u8] = b"~!@#$%^&*_-+=|\\(){}[]:;<>,.?/";

/// Minimum number of character classes a password must cover.
const MIN_CLASSES: usize = 3;

/// Generate a random password that satisfies the usual complexity rules.
pub fn generate() -> String {
    let alphabet: Vec<u8> = [LOWER, UPPER, DIGITS, SYMBOLS].concat();
    let mut rng = rand::rng();

    loop {
        let candidate: String = (0..PASSWORD_LEN)
            .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
            .collect();

        if class_count(&candidate) >= MIN_CLASSES {
            return candidate;
        }
    }
}

/// Number of character classes present in `password`.
pub fn class_count(password: &str) -> usize {
    [LOWER, UPPER, DIGITS, SYMBOLS]
        .iter()
        .filter(|class| password.bytes().any(|b| class.contains(&b)))
        .count()
}
