//! HMAC-SHA-512 sealing of on-disk headers and trailers.
//!
//! [`crate::tblock`], [`crate::tslab`], and the catalog's `main.db` sidecar
//! all share one sealing convention: the trailing 64 bytes of a region are
//! zeroed, the HMAC-SHA-512 of the whole region is computed, and the digest
//! is written back into those 64 bytes. Opening such a region recomputes the
//! digest the same way and compares it against what's stored.
//!
//! The key is supplied by the caller (see [`crate::config::RondoConfig`]);
//! this module has no notion of key provisioning or rotation.

use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::error::{Result, RondoError};

/// Size of an HMAC-SHA-512 digest, and of the trailer region it seals.
pub const TRAILER_LEN: usize = 64;

type HmacSha512 = Hmac<Sha512>;

/// Computes the HMAC-SHA-512 of `buf` with its trailing [`TRAILER_LEN`]
/// bytes treated as zero, and writes the digest into those trailing bytes.
///
/// `buf` must be at least [`TRAILER_LEN`] bytes long.
pub fn seal(key: &[u8], buf: &mut [u8]) {
    let digest = digest_with_zeroed_trailer(key, buf);
    let trailer_start = buf.len() - TRAILER_LEN;
    buf[trailer_start..].copy_from_slice(&digest);
}

/// Recomputes the HMAC-SHA-512 of `buf` (trailer zeroed) and compares it
/// against the digest stored in the trailing [`TRAILER_LEN`] bytes.
///
/// # Errors
///
/// Returns [`RondoError::BadHmac`] if the digests do not match.
pub fn check(key: &[u8], buf: &[u8], what: &str) -> Result<()> {
    let trailer_start = buf.len() - TRAILER_LEN;
    let stored = &buf[trailer_start..];

    // `verify_slice` compares in constant time.
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&buf[..trailer_start]);
    mac.update(&[0u8; TRAILER_LEN]);
    mac.verify_slice(stored)
        .map_err(|_| RondoError::BadHmac(what.to_string()))
}

fn digest_with_zeroed_trailer(key: &[u8], buf: &[u8]) -> [u8; TRAILER_LEN] {
    let trailer_start = buf.len() - TRAILER_LEN;
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&buf[..trailer_start]);
    mac.update(&[0u8; TRAILER_LEN]);
    mac.finalize().into_bytes().into()
}
