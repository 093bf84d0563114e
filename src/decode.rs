//! Transport image to RGB pixels.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use image::RgbImage;
use serde::Deserialize;

use crate::error::ServiceError;

/// Image reference as it arrives on the wire. Inline bytes win over the URL
/// when both are present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageSource {
    #[serde(default)]
    pub b64: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ImageSource {
    pub fn inline(b64: impl Into<String>) -> Self {
        Self {
            b64: Some(b64.into()),
            url: None,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            b64: None,
            url: Some(url.into()),
        }
    }

    /// Checks that at least one reference is usable without touching the
    /// network.
    pub fn validate(&self) -> Result<(), ServiceError> {
        let has_b64 = self.b64.as_deref().is_some_and(|s| !s.trim().is_empty());
        let has_url = self.url.as_deref().is_some_and(|s| !s.trim().is_empty());
        if has_b64 || has_url {
            Ok(())
        } else {
            Err(ServiceError::InvalidInput(
                "image url or base64 should be provided".into(),
            ))
        }
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, ServiceError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Fetch(e.to_string()))?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, ServiceError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ServiceError::InvalidInput(format!("invalid image url {url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServiceError::InvalidInput(format!(
                "unsupported image url scheme {:?}",
                parsed.scheme()
            )));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ServiceError::Fetch(e.to_string()))?;
        if response
            .content_length()
            .is_some_and(|len| len as usize > self.max_bytes)
        {
            return Err(ServiceError::InvalidInput(format!(
                "image exceeds {} bytes",
                self.max_bytes
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceError::Fetch(e.to_string()))?;
        if body.len() > self.max_bytes {
            return Err(ServiceError::InvalidInput(format!(
                "image exceeds {} bytes",
                self.max_bytes
            )));
        }
        Ok(body)
    }
}

pub struct ImageDecoder {
    fetcher: Box<dyn ImageFetcher>,
    max_bytes: usize,
}

impl ImageDecoder {
    pub fn new(fetcher: Box<dyn ImageFetcher>, max_bytes: usize) -> Self {
        Self { fetcher, max_bytes }
    }

    pub async fn decode(&self, source: &ImageSource) -> Result<RgbImage, ServiceError> {
        source.validate()?;
        let bytes = match source.b64.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(b64) => decode_base64(b64, self.max_bytes)?,
            None => {
                let url = source.url.as_deref().unwrap_or_default().trim();
                tracing::debug!(url, "fetching remote image");
                self.fetcher.fetch(url).await?
            }
        };
        decode_bytes(&bytes)
    }
}

fn decode_base64(b64: &str, max_bytes: usize) -> Result<Bytes, ServiceError> {
    // Accept data URLs as produced by browsers.
    let payload = match b64.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => b64,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ServiceError::InvalidInput(format!("invalid base64 image: {e}")))?;
    if raw.len() > max_bytes {
        return Err(ServiceError::InvalidInput(format!(
            "image exceeds {max_bytes} bytes"
        )));
    }
    Ok(Bytes::from(raw))
}

pub fn decode_bytes(bytes: &[u8]) -> Result<RgbImage, ServiceError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| ServiceError::InvalidInput(format!("cannot decode image: {e}")))?;
    Ok(image.to_rgb8())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn png_base64(image: &RgbImage) -> String {
        let mut buf = std::io::Cursor::new(Vec::new());
        image
            .write_to(&mut buf, image::ImageFormat::Png)
            .expect("png encoding");
        STANDARD.encode(buf.into_inner())
    }

    /// Serves a fixed body for every URL.
    pub struct StaticFetcher(pub Option<Bytes>);

    #[async_trait]
    impl ImageFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, ServiceError> {
            self.0
                .clone()
                .ok_or_else(|| ServiceError::Fetch(format!("{url}: connection refused")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{StaticFetcher, png_base64};
    use super::*;

    fn decoder(body: Option<Bytes>) -> ImageDecoder {
        ImageDecoder::new(Box::new(StaticFetcher(body)), 1 << 20)
    }

    #[tokio::test]
    async fn decodes_inline_png() {
        let img = RgbImage::from_pixel(5, 3, image::Rgb([9, 8, 7]));
        let source = ImageSource::inline(png_base64(&img));
        let decoded = decoder(None).decode(&source).await.unwrap();
        assert_eq!(decoded.dimensions(), (5, 3));
        assert_eq!(decoded.get_pixel(4, 2).0, [9, 8, 7]);
    }

    #[tokio::test]
    async fn accepts_data_url_prefix() {
        let img = RgbImage::new(2, 2);
        let source = ImageSource::inline(format!("data:image/png;base64,{}", png_base64(&img)));
        assert!(decoder(None).decode(&source).await.is_ok());
    }

    #[tokio::test]
    async fn fetches_remote_image() {
        let img = RgbImage::new(4, 6);
        let body = STANDARD.decode(png_base64(&img)).unwrap();
        let source = ImageSource::remote("http://images.local/cat.png");
        let decoded = decoder(Some(Bytes::from(body))).decode(&source).await.unwrap();
        assert_eq!(decoded.dimensions(), (4, 6));
    }

    #[tokio::test]
    async fn missing_reference_is_invalid_input() {
        let err = decoder(None).decode(&ImageSource::default()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));

        let blank = ImageSource {
            b64: Some("  ".into()),
            url: None,
        };
        assert!(blank.validate().is_err());
    }

    #[tokio::test]
    async fn garbage_bytes_are_invalid_input() {
        let source = ImageSource::inline(STANDARD.encode(b"not an image"));
        let err = decoder(None).decode(&source).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));

        let source = ImageSource::inline("%%%");
        let err = decoder(None).decode(&source).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn fetch_failure_is_server_side() {
        let source = ImageSource::remote("http://images.local/missing.png");
        let err = decoder(None).decode(&source).await.unwrap_err();
        assert!(matches!(err, ServiceError::Fetch(_)));
    }
}
