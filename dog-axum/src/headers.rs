//! tus protocol header names and wire formats.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");
pub const X_CHECKSUM_SHA256: HeaderName = HeaderName::from_static("x-checksum-sha256");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub const TUS_PROTOCOL_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,creation-defer-length,creation-with-upload,expiration";

pub const ALLOWED_METHODS: &str = "POST, GET, HEAD, PATCH, OPTIONS";
pub const ALLOWED_HEADERS: &str = "Authorization, Content-Type, Location, Tus-Extension, Tus-Max-Size, \
Tus-Resumable, Tus-Version, Upload-Defer-Length, Upload-Length, Upload-Metadata, Upload-Offset, \
X-Checksum-Sha256, X-Request-Id, X-Requested-With";
pub const EXPOSED_HEADERS: &str = "Location, Tus-Extension, Tus-Max-Size, Tus-Resumable, Tus-Version, \
Upload-Defer-Length, Upload-Expires, Upload-Length, Upload-Offset, X-Request-Id";

/// Header value as text, if present and visible ASCII.
pub fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

/// A non-negative decimal header. Malformed values read as absent.
pub fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Whether the request declares a non-empty body.
pub fn declares_body(headers: &HeaderMap, exact_len: Option<u64>) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    match header_u64(headers, &header::CONTENT_LENGTH) {
        Some(length) => length > 0,
        None => exact_len != Some(0),
    }
}

/// RFC 7231 IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Controls, space and `%`; non-ASCII bytes are always encoded.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'%');

/// Percent-encode everything outside visible ASCII so a key always fits in a
/// header value.
pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

pub fn value(text: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn malformed_numbers_are_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(UPLOAD_OFFSET, HeaderValue::from_static("12"));
        headers.insert(UPLOAD_LENGTH, HeaderValue::from_static("-3"));
        headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("one"));
        assert_eq!(header_u64(&headers, &UPLOAD_OFFSET), Some(12));
        assert_eq!(header_u64(&headers, &UPLOAD_LENGTH), None);
        assert_eq!(header_u64(&headers, &UPLOAD_DEFER_LENGTH), None);
    }

    #[test]
    fn body_detection() {
        let mut headers = HeaderMap::new();
        assert!(!declares_body(&headers, Some(0)));
        assert!(declares_body(&headers, Some(3)));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!declares_body(&headers, None));
    }

    #[test]
    fn formats_imf_fixdate() {
        let at = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(http_date(at), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn encodes_non_ascii_keys() {
        assert_eq!(encode_path("/files/a b/ü%"), "/files/a%20b/%C3%BC%25");
        assert_eq!(encode_path("/files/tab\there"), "/files/tab%09here");
        assert_eq!(encode_path("/files/plain-name_1.txt"), "/files/plain-name_1.txt");
    }
}
