//! ==============================================================================
//! signature.rs - upload authenticity and freshness
//! ==============================================================================
//!
//! a device signs every upload with hex(digest("device_id:timestamp:secret")).
//! the hub recomputes the digest with the secret it holds for that device and
//! compares it byte for byte. the timestamp must lie within the freshness
//! window of the hub's clock.
//!
//! ==============================================================================

use md5::Md5;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::domain::Device;
use crate::error::{IngestError, IngestResult};

/// digest devices use to sign uploads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    #[default]
    Md5,
    Sha256,
}

#[derive(Clone, Debug)]
pub struct SignatureValidator {
    scheme: SignatureScheme,
    freshness_secs: i64,
}

impl SignatureValidator {
    pub fn new(scheme: SignatureScheme, freshness_secs: i64) -> Self {
        Self { scheme, freshness_secs }
    }

    /// lowercase hex signature a device with `secret` would send
    pub fn sign(&self, device_id: &str, timestamp: i64, secret: &str) -> String {
        let message = format!("{}:{}:{}", device_id, timestamp, secret);
        match self.scheme {
            SignatureScheme::Md5 => hex::encode(Md5::digest(message.as_bytes())),
            SignatureScheme::Sha256 => hex::encode(Sha256::digest(message.as_bytes())),
        }
    }

    /// check freshness, then the signature
    ///
    /// freshness is symmetric: a timestamp further than the window in either
    /// direction from `now` is rejected as expired.
    pub fn validate(
        &self,
        device: &Device,
        timestamp: i64,
        signature: &str,
        now: i64,
    ) -> IngestResult<()> {
        if now.saturating_sub(timestamp).abs() > self.freshness_secs {
            return Err(IngestError::ExpiredRequest);
        }

        let expected = self.sign(&device.device_id, timestamp, &device.secret);
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(IngestError::InvalidSignature);
        }
        Ok(())
    }
}
