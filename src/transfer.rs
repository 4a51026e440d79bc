//! Fetches originals from, and delivers compressed results to, the blob store.

use crate::error::TransferError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};

/// Remote store for original and compressed images.
#[async_trait]
pub trait BlobTransfer: Send + Sync {
    /// Raw bytes of the uploaded original.
    async fn fetch_original(&self, filename: &str) -> Result<Vec<u8>, TransferError>;

    /// Uploads a compressed result under `filename`.
    async fn push_compressed(&self, filename: &str, bytes: Vec<u8>) -> Result<(), TransferError>;
}

/// [`BlobTransfer`] over HTTP.
///
/// `GET {base}/images-uploaded/{filename}` returns the original and
/// `POST {base}/compressed` takes a multipart form with a single `file` field.
/// Anything other than `200 OK` is a failure.
#[derive(Clone, Debug)]
pub struct HttpBlobTransfer {
    client: Client,
    base_url: Url,
}

impl HttpBlobTransfer {
    pub fn new(base_url: &str) -> Result<Self, TransferError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self, TransferError> {
        let base_url = Url::parse(base_url).map_err(|e| TransferError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(TransferError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { client, base_url })
    }

    /// Appends path segments, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, TransferError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransferError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl BlobTransfer for HttpBlobTransfer {
    async fn fetch_original(&self, filename: &str) -> Result<Vec<u8>, TransferError> {
        let url = self.endpoint(&["images-uploaded", filename])?;
        let response = self.client.get(url.clone()).send().await?;

        if response.status() != StatusCode::OK {
            return Err(TransferError::Status {
                method: "GET",
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        log::debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    async fn push_compressed(&self, filename: &str, bytes: Vec<u8>) -> Result<(), TransferError> {
        let url = self.endpoint(&["compressed"])?;
        let size = bytes.len();
        let form = Form::new().part("file", Part::bytes(bytes).file_name(filename.to_string()));

        let response = self.client.post(url.clone()).multipart(form).send().await?;
        if response.status() != StatusCode::OK {
            return Err(TransferError::Status {
                method: "POST",
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        log::debug!("Uploaded {} ({} bytes) to {}", filename, size, url);
        Ok(())
    }
}
