//! Wire-level constants and header codecs.
//!
//! Covers the tus 1.0.0 headers plus the `x-uploader-*` extension headers
//! the upload client sends: file naming, metadata transport, base-URL and
//! endpoint-URL overrides.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::errors::UploadError;

// -- Protocol constants -------------------------------------------------------

/// Protocol version this server speaks.
pub const TUS_RESUMABLE: &str = "1.0.0";

/// Comma-separated list of supported versions.
pub const TUS_VERSION: &str = "1.0.0";

/// Supported protocol extensions.
pub const TUS_EXTENSIONS: &str =
    "creation,creation-with-upload,creation-defer-length,termination,expiration";

/// Required content type of chunk bodies.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Characters escaped when an upload id is placed in a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

// -- Header names -------------------------------------------------------------

pub const H_TUS_RESUMABLE: &str = "tus-resumable";
pub const H_TUS_VERSION: &str = "tus-version";
pub const H_TUS_EXTENSION: &str = "tus-extension";
pub const H_TUS_MAX_SIZE: &str = "tus-max-size";
pub const H_UPLOAD_OFFSET: &str = "upload-offset";
pub const H_UPLOAD_LENGTH: &str = "upload-length";
pub const H_UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const H_UPLOAD_METADATA: &str = "upload-metadata";
pub const H_UPLOAD_EXPIRES: &str = "upload-expires";

pub const H_FILE_NAME: &str = "x-uploader-file-name";
pub const H_FILE_EXT: &str = "x-uploader-file-ext";
pub const H_FILE_ID: &str = "x-uploader-file-id";
pub const H_BASE_URL: &str = "x-uploader-base-url";
pub const H_ENDPOINT_URL: &str = "x-uploader-endpoint-url";
pub const H_METADATA: &str = "x-uploader-metadata";
pub const H_FILE_EXIST: &str = "x-uploader-file-exist";

/// Headers browsers must be allowed to read from responses.
pub const EXPOSED_HEADERS: &[&str] = &[
    H_TUS_RESUMABLE,
    H_TUS_VERSION,
    H_TUS_EXTENSION,
    H_TUS_MAX_SIZE,
    H_UPLOAD_OFFSET,
    H_UPLOAD_LENGTH,
    H_UPLOAD_DEFER_LENGTH,
    H_UPLOAD_METADATA,
    H_UPLOAD_EXPIRES,
    H_FILE_NAME,
    H_FILE_ID,
    H_FILE_EXIST,
    "location",
];

// -- Header helpers -----------------------------------------------------------

/// A header value as `&str`, if present and valid ASCII.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse a non-negative integer header. Absent is `Ok(None)`.
pub fn parse_u64_header(headers: &HeaderMap, name: &str) -> Result<Option<u64>, UploadError> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| UploadError::InvalidHeader {
                message: format!("{name} must be a non-negative integer"),
            }),
    }
}

/// `true` when `Upload-Defer-Length: 1` is present.
pub fn defers_length(headers: &HeaderMap) -> Result<bool, UploadError> {
    match header_str(headers, H_UPLOAD_DEFER_LENGTH) {
        None => Ok(false),
        Some("1") => Ok(true),
        Some(_) => Err(UploadError::InvalidHeader {
            message: format!("{H_UPLOAD_DEFER_LENGTH} must be 1"),
        }),
    }
}

/// `true` when the request body is a chunk per the content type.
pub fn is_chunk_body(headers: &HeaderMap) -> bool {
    header_str(headers, "content-type")
        .map(|ct| ct.split(';').next().unwrap_or("").trim())
        .is_some_and(|ct| ct.eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
}

// -- Metadata codecs ----------------------------------------------------------

/// Decode a tus `Upload-Metadata` header: `key b64value,key2,key3 b64value`.
pub fn parse_upload_metadata(raw: &str) -> Result<BTreeMap<String, String>, UploadError> {
    let invalid = |message: String| UploadError::InvalidHeader { message };
    let mut out = BTreeMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.split(' ');
        let key = parts.next().unwrap_or_default();
        let value = parts.next();
        if key.is_empty() || parts.next().is_some() {
            return Err(invalid(format!("malformed {H_UPLOAD_METADATA} pair: {pair}")));
        }
        let value = match value {
            None | Some("") => String::new(),
            Some(encoded) => {
                let bytes = BASE64_STANDARD
                    .decode(encoded)
                    .map_err(|_| invalid(format!("{H_UPLOAD_METADATA} value for {key} is not base64")))?;
                String::from_utf8(bytes)
                    .map_err(|_| invalid(format!("{H_UPLOAD_METADATA} value for {key} is not UTF-8")))?
            }
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

/// Encode metadata back into the tus `Upload-Metadata` form.
pub fn encode_upload_metadata(metadata: &BTreeMap<String, String>) -> String {
    metadata
        .iter()
        .filter(|(k, _)| !k.is_empty() && !k.contains([' ', ',']))
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k} {}", BASE64_STANDARD.encode(v))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode the `x-uploader-metadata` JSON header.
///
/// String values are percent-decoded; other JSON values are kept in their
/// JSON text form.
pub fn decode_uploader_metadata(raw: &str) -> Result<BTreeMap<String, String>, UploadError> {
    let parsed: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| UploadError::InvalidHeader {
            message: format!("{H_METADATA} is not a JSON object: {e}"),
        })?;
    Ok(parsed
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => percent_decode(&s),
                other => other.to_string(),
            };
            (k, value)
        })
        .collect())
}

/// All caller metadata on a request: `Upload-Metadata` merged with
/// `x-uploader-metadata` (the latter wins on collision).
pub fn request_metadata(headers: &HeaderMap) -> Result<BTreeMap<String, String>, UploadError> {
    let mut metadata = match header_str(headers, H_UPLOAD_METADATA) {
        Some(raw) => parse_upload_metadata(raw)?,
        None => BTreeMap::new(),
    };
    if let Some(raw) = header_str(headers, H_METADATA) {
        metadata.extend(decode_uploader_metadata(raw)?);
    }
    Ok(metadata)
}

fn percent_decode(s: &str) -> String {
    match percent_decode_str(s).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s.to_string(),
    }
}

// -- Naming -------------------------------------------------------------------

/// The caller-declared target file name, if any.
pub fn declared_file_name(headers: &HeaderMap) -> Option<String> {
    header_str(headers, H_FILE_NAME)
        .map(percent_decode)
        .filter(|name| !name.is_empty())
}

/// Name for a new upload: the declared name, or a random token carrying
/// the `x-uploader-file-ext` extension.
pub fn file_name_for_create(headers: &HeaderMap) -> String {
    if let Some(name) = declared_file_name(headers) {
        return name;
    }
    let token = random_token();
    match header_str(headers, H_FILE_EXT)
        .map(|ext| ext.trim().trim_start_matches('.'))
        .filter(|ext| !ext.is_empty())
    {
        Some(ext) => format!("{token}.{ext}"),
        None => token,
    }
}

/// 32 lowercase hex digits.
pub fn random_token() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

// -- URLs and query -----------------------------------------------------------

/// Parse a raw query string into a map, percent-decoding keys and values.
pub fn parse_query(raw: Option<&str>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                map.insert(
                    percent_decode(&k.replace('+', " ")),
                    percent_decode(&v.replace('+', " ")),
                );
            } else if !part.is_empty() {
                map.insert(percent_decode(part), String::new());
            }
        }
    }
    map
}

/// Request query merged with the query of `x-uploader-endpoint-url`.
pub fn merged_query(raw_query: Option<&str>, headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut query = parse_query(raw_query);
    if let Some(endpoint) = header_str(headers, H_ENDPOINT_URL) {
        let endpoint = percent_decode(endpoint);
        if let Some((_, qs)) = endpoint.split_once('?') {
            let qs = qs.split('#').next().unwrap_or("");
            query.extend(parse_query(Some(qs)));
        }
    }
    query
}

/// The `Location` of an upload.
///
/// `x-uploader-base-url` wins (it compensates for proxy path rewriting),
/// then the configured public base URL, then a relative path.
pub fn location(headers: &HeaderMap, public_base_url: Option<&str>, base_path: &str, id: &str) -> String {
    let encoded_id = utf8_percent_encode(id, PATH_SEGMENT).to_string();
    if let Some(base) = header_str(headers, H_BASE_URL).filter(|b| !b.is_empty()) {
        return format!("{}/{encoded_id}", base.trim_end_matches('/'));
    }
    let path = format!("{}/{encoded_id}", base_path.trim_end_matches('/'));
    match public_base_url.filter(|b| !b.is_empty()) {
        Some(base) => format!("{}{path}", base.trim_end_matches('/')),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_upload_metadata() {
        let parsed =
            parse_upload_metadata("filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,is_confidential")
                .unwrap();
        assert_eq!(parsed["filename"], "world_domination_plan.pdf");
        assert_eq!(parsed["is_confidential"], "");
    }

    #[test]
    fn test_parse_upload_metadata_rejects_bad_base64() {
        assert!(parse_upload_metadata("filename !!!").is_err());
        assert!(parse_upload_metadata("a b c").is_err());
    }

    #[test]
    fn test_encode_upload_metadata_roundtrips_through_parser() {
        let mut meta = BTreeMap::new();
        meta.insert("filename".to_string(), "你好.png".to_string());
        meta.insert("flag".to_string(), String::new());
        let encoded = encode_upload_metadata(&meta);
        assert_eq!(parse_upload_metadata(&encoded).unwrap(), meta);
    }

    #[test]
    fn test_decode_uploader_metadata_percent_decodes() {
        let parsed =
            decode_uploader_metadata(r#"{"name":"%E4%BD%A0%E5%A5%BD.png","width":640,"skip":null}"#)
                .unwrap();
        assert_eq!(parsed["name"], "你好.png");
        assert_eq!(parsed["width"], "640");
        assert!(!parsed.contains_key("skip"));
    }

    #[test]
    fn test_decode_uploader_metadata_keeps_case() {
        let parsed = decode_uploader_metadata(r#"{"Title":"A","title":"b"}"#).unwrap();
        assert_eq!(parsed["Title"], "A");
        assert_eq!(parsed["title"], "b");
    }

    #[test]
    fn test_decode_uploader_metadata_rejects_non_object() {
        assert!(decode_uploader_metadata("[1,2]").is_err());
    }

    #[test]
    fn test_request_metadata_prefers_uploader_header() {
        let h = headers(&[
            (H_UPLOAD_METADATA, "filename b2xkLnBuZw=="),
            (H_METADATA, r#"{"filename":"new.png"}"#),
        ]);
        assert_eq!(request_metadata(&h).unwrap()["filename"], "new.png");
    }

    #[test]
    fn test_file_name_prefers_declared_header() {
        let h = headers(&[(H_FILE_NAME, "abc%20def.png"), (H_FILE_EXT, "jpg")]);
        assert_eq!(file_name_for_create(&h), "abc def.png");
    }

    #[test]
    fn test_file_name_random_with_extension() {
        let h = headers(&[(H_FILE_EXT, ".webp")]);
        let name = file_name_for_create(&h);
        let (token, ext) = name.split_once('.').unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ext, "webp");
    }

    #[test]
    fn test_file_name_random_without_extension() {
        let name = file_name_for_create(&HeaderMap::new());
        assert_eq!(name.len(), 32);
        assert_ne!(name, file_name_for_create(&HeaderMap::new()));
    }

    #[test]
    fn test_merged_query_endpoint_wins() {
        let h = headers(&[(H_ENDPOINT_URL, "/api/upload?folder=7&storage=local")]);
        let query = merged_query(Some("folder=1&token=x"), &h);
        assert_eq!(query["folder"], "7");
        assert_eq!(query["storage"], "local");
        assert_eq!(query["token"], "x");
    }

    #[test]
    fn test_location_variants() {
        let plain = HeaderMap::new();
        assert_eq!(location(&plain, None, "/files", "a.png"), "/files/a.png");
        assert_eq!(location(&plain, None, "/files", "你 好"), "/files/%E4%BD%A0%20%E5%A5%BD");
        assert_eq!(
            location(&plain, Some("https://cdn.example/"), "/files/", "abc"),
            "https://cdn.example/files/abc"
        );
        let proxied = headers(&[(H_BASE_URL, "https://example.com/api/uploads/")]);
        assert_eq!(
            location(&proxied, Some("https://ignored"), "/files", "abc"),
            "https://example.com/api/uploads/abc"
        );
    }

    #[test]
    fn test_parse_u64_header() {
        let h = headers(&[(H_UPLOAD_OFFSET, "42"), (H_UPLOAD_LENGTH, "-1")]);
        assert_eq!(parse_u64_header(&h, H_UPLOAD_OFFSET).unwrap(), Some(42));
        assert!(parse_u64_header(&h, H_UPLOAD_LENGTH).is_err());
        assert_eq!(parse_u64_header(&h, "missing").unwrap(), None);
    }

    #[test]
    fn test_is_chunk_body() {
        assert!(is_chunk_body(&headers(&[("content-type", OFFSET_OCTET_STREAM)])));
        assert!(!is_chunk_body(&headers(&[("content-type", "application/json")])));
        assert!(!is_chunk_body(&HeaderMap::new()));
    }
}
