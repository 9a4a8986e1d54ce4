//! Deterministic passage-credential derivation via HKDF-SHA256.
//!
//! The password a node accepts for a given (server, subject) relationship is
//! re-derived from the ticket strings on every passage resolution. The same
//! inputs always produce the same secret, and the arity of the derivation is
//! part of the domain separation, so a relay-mediated three-way credential
//! can never collide with a direct two-way one.

use hkdf::Hkdf;
use sha2::Sha256;
use uuid::Uuid;

/// HKDF salt for domain separation (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"hawser-passage-hkdf-salt-v1";

/// Info prefix for password derivation.
const PASSWORD_INFO: &str = "hawser-passage-password-v1";

/// Info prefix for user-id derivation.
const USER_ID_INFO: &str = "hawser-passage-user-id-v1";

/// Length of a derived password in characters.
///
/// Deployed node agents allocate fixed-size credential buffers; changing
/// this constant breaks interop with every agent already in the field.
pub const DERIVED_PASSWORD_LEN: usize = 21;

/// Expand the ticket tuple into 32 bytes of keying material.
///
/// Each part is length-prefixed in the input keying material so that e.g.
/// `("ab", "c")` and `("a", "bc")` can never produce the same output.
#[allow(clippy::expect_used)] // 32 bytes is always within the HKDF-SHA256 output bound
fn expand(parts: &[&str], info_prefix: &str) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(parts.iter().map(|p| p.len() + 4).sum());
    for part in parts {
        ikm.extend_from_slice(&(part.len() as u32).to_be_bytes());
        ikm.extend_from_slice(part.as_bytes());
    }

    let info = format!("{info_prefix}/{}", parts.len());
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .expect("fixed 32-byte HKDF output");
    okm
}

/// Derive the password for a ticket tuple.
///
/// Two-way form: `(server_ticket, subject_ticket)`. Three-way form:
/// `(server_ticket, relay_ticket, user_ticket)`.
pub fn derive_password(parts: &[&str]) -> String {
    let okm = expand(parts, PASSWORD_INFO);
    let mut encoded = hex::encode(okm);
    encoded.truncate(DERIVED_PASSWORD_LEN);
    encoded
}

/// Derive a stable user id for protocols that authenticate by UUID.
///
/// Independent of [`derive_password`] for the same tuple.
pub fn derive_uuid(parts: &[&str]) -> Uuid {
    let okm = expand(parts, USER_ID_INFO);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&okm[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}
