//! Capability generation
//!
//! Each token is 32 random bytes, base64 encoded (44 characters) with `/`
//! replaced by `-` because the wire format reserves `/`. Uniqueness rests on
//! the entropy width alone; the allocation store rejects a duplicate inside the
//! insert transaction instead of retrying here.

use crate::allocation::{Capabilities, Capability};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};

/// Random bytes drawn per capability
pub const CAP_ENTROPY_BYTES: usize = 32;

/// Length of the encoded token
pub const CAP_TEXT_LEN: usize = 44;

/// Generate read, write and manage tokens from the OS RNG
pub fn generate() -> Capabilities {
    generate_with(&mut OsRng)
}

/// Generate tokens from a caller-provided cryptographic RNG
pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Capabilities {
    Capabilities {
        read: one(rng),
        write: one(rng),
        manage: one(rng),
    }
}

fn one<R: RngCore + CryptoRng>(rng: &mut R) -> Capability {
    let mut bytes = [0u8; CAP_ENTROPY_BYTES];
    rng.fill_bytes(&mut bytes);
    Capability::new(STANDARD.encode(bytes).replace('/', "-"))
}
