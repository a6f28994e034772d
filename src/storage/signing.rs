//! Shared-key request signing for Azure Storage and Cosmos DB

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Decode a base64 account key
pub fn decode_key(key: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(key.trim())
        .map_err(|e| Error::config(format!("Account key is not valid base64: {}", e)))
}

/// Base64 HMAC-SHA256 of `payload` under `key`
pub fn sign(key: &[u8], payload: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| Error::config(format!("Invalid signing key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// RFC 1123 date as used by `x-ms-date`
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
