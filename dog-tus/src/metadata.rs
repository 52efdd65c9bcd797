//! Request header collaborators: `Upload-Metadata` and the declared
//! SHA-256 checksum.

use std::collections::BTreeMap;

use base64::Engine;
use dog_blob::Sha256Digest;

use crate::{TusError, TusResult};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Decoded `Upload-Metadata` pairs. Values are optional per the protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    entries: BTreeMap<String, Option<String>>,
}

impl UploadMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_deref())
    }

    /// Object key requested by the client.
    pub fn filename(&self) -> Option<&str> {
        self.get("filename").filter(|f| !f.is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse `key base64(value)` pairs separated by commas.
pub fn parse_upload_metadata(header: &str) -> TusResult<UploadMetadata> {
    let mut entries = BTreeMap::new();
    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut fields = pair.split_whitespace();
        let Some(key) = fields.next() else { continue };
        let value = match fields.next() {
            Some(encoded) => {
                let raw = B64
                    .decode(encoded)
                    .map_err(|e| TusError::bad_metadata(format!("value for {key} is not base64: {e}")))?;
                let text = String::from_utf8(raw)
                    .map_err(|_| TusError::bad_metadata(format!("value for {key} is not UTF-8")))?;
                Some(text)
            }
            None => None,
        };
        if fields.next().is_some() {
            return Err(TusError::bad_metadata(format!("malformed pair {pair:?}")));
        }
        if entries.insert(key.to_string(), value).is_some() {
            return Err(TusError::bad_metadata(format!("duplicate key {key}")));
        }
    }
    Ok(UploadMetadata { entries })
}

/// Build a header value carrying only `filename`.
pub fn encode_filename(filename: &str) -> String {
    format!("filename {}", B64.encode(filename))
}

/// Decode a base64 SHA-256 digest.
pub fn parse_checksum(header: &str) -> TusResult<Sha256Digest> {
    let raw = B64
        .decode(header.trim())
        .map_err(|e| TusError::bad_checksum(format!("not base64: {e}")))?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| TusError::bad_checksum(format!("expected 32 bytes, got {}", raw.len())))
}

pub fn encode_checksum(digest: &Sha256Digest) -> String {
    B64.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_blob::sha256;

    #[test]
    fn parses_filename_and_flags() {
        let header = format!("{}, is_confidential, type {}", encode_filename("apps/1/bundle.zip"), B64.encode("zip"));
        let meta = parse_upload_metadata(&header).unwrap();
        assert_eq!(meta.filename(), Some("apps/1/bundle.zip"));
        assert_eq!(meta.get("type"), Some("zip"));
        assert_eq!(meta.get("is_confidential"), None);
        assert_eq!(meta.len(), 3);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            parse_upload_metadata("filename ***"),
            Err(TusError::BadMetadata { .. })
        ));
        assert!(parse_upload_metadata("a YQ==, a YQ==").is_err());
        assert!(parse_upload_metadata("a YQ== extra").is_err());
        assert_eq!(parse_upload_metadata("").unwrap().filename(), None);
    }

    #[test]
    fn checksum_must_be_32_bytes() {
        let digest = sha256(b"payload");
        assert_eq!(parse_checksum(&encode_checksum(&digest)).unwrap(), digest);
        assert!(matches!(
            parse_checksum(&B64.encode([1u8; 16])),
            Err(TusError::BadChecksum { .. })
        ));
        assert!(parse_checksum("%%").is_err());
    }
}
