//! One-time passcode generation.

use std::fmt;

use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};

/// Length of the passcode issued for every mediated open.
pub const OTP_LENGTH: usize = 7;

/// Mixed-case letters and digits.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// A single-use passcode. Lives for one open call.
pub struct Otp(SecretString);

impl Otp {
    /// Compare a user-supplied response against this passcode.
    #[must_use]
    pub fn matches(&self, response: &str) -> bool {
        let expected = self.0.expose_secret().as_bytes();
        let response = response.as_bytes();
        // Length is not secret; the contents are compared without early exit.
        expected.len() == response.len()
            && expected
                .iter()
                .zip(response)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    /// The raw token, for handing to the delivery gateway.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Otp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Otp(****)")
    }
}

/// Generates passcodes of a fixed length, sampled uniformly from [`ALPHABET`].
#[derive(Debug, Clone, Copy)]
pub struct OtpGenerator {
    length: usize,
}

impl Default for OtpGenerator {
    fn default() -> Self {
        Self::new(OTP_LENGTH)
    }
}

impl OtpGenerator {
    #[must_use]
    pub const fn new(length: usize) -> Self {
        Self { length }
    }

    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn generate(&self) -> Otp {
        let mut rng = rand::thread_rng();
        let token: String = (0..self.length)
            .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
            .collect();
        Otp(SecretString::from(token))
    }
}
