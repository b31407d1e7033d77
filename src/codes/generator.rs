//! Random code generation.

use anyhow::{Context, Result, anyhow};
use rand::{RngCore, rngs::OsRng};

/// Digits for short codes read out or typed by patients.
pub const NUMERIC: &[u8] = b"0123456789";

/// Lowercase alphanumerics for long codes embedded in links.
pub const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Draw `length` characters uniformly from `alphabet` using the OS RNG.
///
/// Bytes at or above the largest multiple of the alphabet size are discarded
/// so every character is equally likely.
///
/// # Errors
/// Returns an error if the alphabet is empty or larger than 256 symbols, or if
/// the OS random source fails.
pub fn generate(length: usize, alphabet: &[u8]) -> Result<String> {
    let size = alphabet.len();
    if size == 0 || size > 256 {
        return Err(anyhow!("alphabet must have between 1 and 256 symbols"));
    }
    let limit = 256 - (256 % size);

    let mut code = String::with_capacity(length);
    let mut buffer = [0u8; 64];
    while code.len() < length {
        OsRng
            .try_fill_bytes(&mut buffer)
            .context("failed to generate verification code")?;
        for byte in buffer {
            if usize::from(byte) >= limit {
                continue;
            }
            code.push(char::from(alphabet[usize::from(byte) % size]));
            if code.len() == length {
                break;
            }
        }
    }
    Ok(code)
}

/// # Errors
/// Returns an error if the OS random source fails.
pub fn short_code(length: usize) -> Result<String> {
    generate(length, NUMERIC)
}

/// # Errors
/// Returns an error if the OS random source fails.
pub fn long_code(length: usize) -> Result<String> {
    generate(length, ALPHANUMERIC)
}
