//! Source map retrieval
//!
//! Maps arrive over `http(s)://`, `file://` or inline `data:` URLs.
//! Failures here are silent at the call sites: a script without a usable
//! map still debugs as compiled code.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use url::Url;

use crate::common::{Error, Result};

/// Fetch a source map body from `url`
pub async fn fetch(url: &str) -> Result<String> {
    if let Some(rest) = url.strip_prefix("data:") {
        return decode_data_url(url, rest);
    }

    if url.starts_with("file://") {
        let path = Url::parse(url)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| Error::source_map_fetch(url, "invalid file URL"))?;
        return tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::source_map_fetch(url, e));
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        let response = reqwest::get(url)
            .await
            .map_err(|e| Error::source_map_fetch(url, e))?;
        if !response.status().is_success() {
            return Err(Error::source_map_fetch(url, response.status()));
        }
        return response
            .text()
            .await
            .map_err(|e| Error::source_map_fetch(url, e));
    }

    Err(Error::source_map_fetch(url, "unsupported URL scheme"))
}

fn decode_data_url(url: &str, rest: &str) -> Result<String> {
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::source_map_fetch(url, "malformed data URL"))?;

    if meta.ends_with(";base64") {
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| Error::source_map_fetch(url, e))?;
        String::from_utf8(bytes).map_err(|e| Error::source_map_fetch(url, e))
    } else {
        Ok(payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decodes_base64_data_urls() {
        let body = "{\"version\":3}";
        let url = format!("data:application/json;base64,{}", BASE64.encode(body));
        assert_eq!(fetch(&url).await.unwrap(), body);
    }

    #[tokio::test]
    async fn passes_plain_data_urls_through() {
        let url = "data:application/json,{\"version\":3}";
        assert_eq!(fetch(url).await.unwrap(), "{\"version\":3}");
    }

    #[tokio::test]
    async fn rejects_unknown_schemes() {
        assert!(fetch("ftp://example.com/map").await.is_err());
    }
}
