use async_trait::async_trait;
use reqwest::{multipart, Client};
use std::time::Duration;

/// Longest error body kept from a failed conversion response.
const MAX_ERROR_BODY: usize = 512;

/// Renders a source document into a displayable artifact.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `source` (named `filename`) and return the rendered PDF bytes.
    async fn convert(&self, filename: &str, source: Vec<u8>) -> Result<Vec<u8>, ConversionError>;
}

/// Client for a Gotenberg-style conversion service (LibreOffice route).
pub struct ConversionClient {
    http: Client,
    endpoint: String,
}

impl ConversionClient {
    /// `request_timeout` caps a single HTTP exchange; workers additionally bound
    /// the whole attempt.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ConversionError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(ConversionError::Http)?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/forms/libreoffice/convert",
                base_url.trim_end_matches('/')
            ),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Converter for ConversionClient {
    async fn convert(&self, filename: &str, source: Vec<u8>) -> Result<Vec<u8>, ConversionError> {
        let part = multipart::Part::bytes(source).file_name(filename.to_string());
        let form = multipart::Form::new().part("files", part);

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(ConversionError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|&i| body.is_char_boundary(i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(ConversionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(ConversionError::Http)?;
        if bytes.is_empty() {
            return Err(ConversionError::EmptyOutput);
        }
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Conversion service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Conversion service returned an empty document")]
    EmptyOutput,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_url() {
        let client = ConversionClient::new("http://gotenberg:3000/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint(),
            "http://gotenberg:3000/forms/libreoffice/convert"
        );
    }
}
