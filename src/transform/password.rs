//! The password transform.
//!
//! Cleartext passwords arriving in the change stream are replaced with
//! `hex(salt)$hex(argon2id(cleartext, salt))` using the parameters
//! t=3, m=64 MiB, p=4, output length 32. Values that already carry that
//! shape pass through unchanged: re-hashing a digest would break parity
//! with source logins without anonymizing anything further.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::StdRng;

use crate::error::KashoError;

/// argon2id parameters fixed by the output format.
const T_COST: u32 = 3;
const M_COST_KIB: u32 = 64 * 1024;
const P_COST: u32 = 4;
const OUTPUT_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// Hash a cleartext password into the `salt$digest` wire form.
///
/// `salt` comes from the deterministic seed in deterministic mode and
/// from `rng` otherwise.
pub fn hash_password(
    cleartext: &str,
    deterministic_salt: Option<[u8; SALT_LEN]>,
    rng: &mut StdRng,
) -> Result<String, KashoError> {
    let salt = match deterministic_salt {
        Some(salt) => salt,
        None => {
            let mut salt = [0u8; SALT_LEN];
            rng.fill_bytes(&mut salt);
            salt
        }
    };

    let params = Params::new(M_COST_KIB, T_COST, P_COST, Some(OUTPUT_LEN))
        .map_err(|e| KashoError::Internal(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut digest = [0u8; OUTPUT_LEN];
    argon
        .hash_password_into(cleartext.as_bytes(), &salt, &mut digest)
        .map_err(|e| KashoError::Internal(format!("argon2: {e}")))?;

    Ok(format!("{}${}", hex::encode(salt), hex::encode(digest)))
}

/// Format heuristic for values that are already hashed: lowercase hex
/// salt, `$`, 64 lowercase hex digits.
pub fn looks_hashed(value: &str) -> bool {
    let Some((salt, digest)) = value.split_once('$') else {
        return false;
    };
    !salt.is_empty()
        && digest.len() == OUTPUT_LEN * 2
        && salt.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        && digest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
