//! HMAC-SHA256 primitives shared by both webhook providers.
//!
//! Both providers sign `{prefix}.{body}` style content with HMAC-SHA256 and
//! differ only in header layout and digest encoding. Comparison is always done
//! through [`Mac::verify_slice`], which is constant time.

use super::VerificationError;
use crate::Timestamp;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Default maximum distance between the signed timestamp and local time.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

const SVIX_SECRET_PREFIX: &str = "whsec_";

/// HMAC key material for webhook verification.
///
/// The bytes are zeroed on drop and never printed.
#[derive(Clone)]
pub struct SigningSecret(Zeroizing<Vec<u8>>);

impl SigningSecret {
    /// Use the given bytes as the HMAC key verbatim
    pub fn from_raw(secret: impl AsRef<[u8]>) -> Self {
        Self(Zeroizing::new(secret.as_ref().to_vec()))
    }

    /// Parse a `whsec_<base64>` secret as issued by the auth provider's
    /// webhook dashboard.
    ///
    /// Secrets without the prefix are used as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ValidationError::InvalidFormat`] when the prefixed
    /// portion is not valid base64, and `Required` when it is empty.
    pub fn from_prefixed_base64(secret: &str) -> Result<Self, crate::ValidationError> {
        let Some(encoded) = secret.strip_prefix(SVIX_SECRET_PREFIX) else {
            return Self::non_empty(secret.as_bytes());
        };

        let decoded = Zeroizing::new(STANDARD.decode(encoded).map_err(|_| {
            crate::ValidationError::InvalidFormat {
                field: "webhook_secret".to_string(),
                message: "secret after 'whsec_' prefix is not valid base64".to_string(),
            }
        })?);
        Self::non_empty(&decoded)
    }

    fn non_empty(bytes: &[u8]) -> Result<Self, crate::ValidationError> {
        if bytes.is_empty() {
            return Err(crate::ValidationError::Required {
                field: "webhook_secret".to_string(),
            });
        }
        Ok(Self::from_raw(bytes))
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.0).expect("HMAC-SHA256 accepts keys of any length")
    }

    /// Compute the HMAC-SHA256 digest over the concatenation of `parts`
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut mac = self.mac();
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().to_vec()
    }

    /// Constant-time check that `expected` is the digest of `parts`
    pub fn verify(&self, parts: &[&[u8]], expected: &[u8]) -> bool {
        let mut mac = self.mac();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(expected).is_ok()
    }
}

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SigningSecret").field(&"<REDACTED>").finish()
    }
}

/// Reject timestamps further than `tolerance` from `now`, in either direction.
///
/// Future-dated timestamps are rejected too so a captured request cannot be
/// pre-signed for later replay.
pub fn check_freshness(
    signed_at: Timestamp,
    now: Timestamp,
    tolerance: Duration,
) -> Result<(), VerificationError> {
    let skew = signed_at.abs_diff(now);
    if skew > tolerance {
        return Err(VerificationError::StaleEvent {
            skew_seconds: skew.as_secs(),
            tolerance_seconds: tolerance.as_secs(),
        });
    }
    Ok(())
}

/// Parse a unix-seconds header value into a [`Timestamp`]
pub fn parse_unix_seconds(value: &str) -> Result<Timestamp, VerificationError> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|seconds| Timestamp::from_unix_seconds(seconds).ok())
        .ok_or_else(|| VerificationError::InvalidSignature {
            reason: "signature timestamp is not a unix timestamp".to_string(),
        })
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
