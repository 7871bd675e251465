//! Sync payload codec: JSON, gzip-compressed, base64-encoded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use ng_devhub_error::{HubError, HubResult};
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};

pub fn compress<T: Serialize + ?Sized>(value: &T) -> HubResult<String> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

pub fn decompress<T: DeserializeOwned>(encoded: &str) -> HubResult<T> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .map_err(|e| HubError::Codec(format!("invalid base64 payload: {e}")))?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| HubError::Codec(format!("invalid gzip payload: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}
