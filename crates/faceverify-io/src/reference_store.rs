//! Reference-image service client.

use async_trait::async_trait;
use chrono::Utc;
use faceverify_core::wire::{FaceVerifyRequest, FaceVerifyResponse, FACEVERIFY_PATH};
use faceverify_core::ReferenceSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("matric number is empty")]
    EmptyIdentifier,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reference service returned HTTP {status}")]
    Status { status: u16 },
    #[error("malformed response body: {0}")]
    MalformedBody(#[source] serde_json::Error),
}

/// Source of reference descriptors for a matric number.
///
/// A failed fetch must not touch any reference set the caller already holds.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn fetch(&self, matric_number: &str) -> Result<ReferenceSet, AcquisitionError>;
}

/// `POST {base_url}/api/v1/test/faceverify` over HTTP.
pub struct HttpReferenceStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReferenceStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AcquisitionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!("{}{}", base_url.trim_end_matches('/'), FACEVERIFY_PATH);
        tracing::debug!(%endpoint, timeout_ms = timeout.as_millis() as u64, "reference store ready");
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReferenceStore for HttpReferenceStore {
    async fn fetch(&self, matric_number: &str) -> Result<ReferenceSet, AcquisitionError> {
        if matric_number.trim().is_empty() {
            return Err(AcquisitionError::EmptyIdentifier);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&FaceVerifyRequest {
                matric_number: matric_number.to_string(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AcquisitionError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let parsed: FaceVerifyResponse =
            serde_json::from_slice(&body).map_err(AcquisitionError::MalformedBody)?;
        let set = parsed.into_reference_set(matric_number, Utc::now());

        tracing::info!(
            matric_number,
            records = set.len(),
            usable = set.usable(),
            "reference set fetched"
        );

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn store(server: &mockito::ServerGuard) -> HttpReferenceStore {
        HttpReferenceStore::new(&server.url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let store =
            HttpReferenceStore::new("https://api.example.edu/", Duration::from_secs(1)).unwrap();
        assert_eq!(store.endpoint(), "https://api.example.edu/api/v1/test/faceverify");
    }

    #[tokio::test]
    async fn test_fetch_posts_matric_number_and_parses_images() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", FACEVERIFY_PATH)
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"matric_number": "CSC/2019/001"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "images": [
                        {"url": "https://cdn/1.jpg", "descriptor": [0.1, 0.2, 0.3]},
                        {"url": "https://cdn/2.jpg"}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let set = store(&server).fetch("CSC/2019/001").await.unwrap();
        mock.assert_async().await;

        assert_eq!(set.matric_number, "CSC/2019/001");
        assert_eq!(set.len(), 2);
        assert_eq!(set.usable(), 1);
        assert_eq!(set.records[0].descriptor.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", FACEVERIFY_PATH)
            .with_status(404)
            .with_body(r#"{"message": "student not found"}"#)
            .create_async()
            .await;

        let err = store(&server).fetch("NOPE/000").await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Status { status: 404 }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_fetch_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", FACEVERIFY_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": []}"#)
            .create_async()
            .await;

        let err = store(&server).fetch("CSC/2019/001").await.unwrap_err();
        assert!(matches!(err, AcquisitionError::MalformedBody(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_fetch_rejects_empty_identifier_without_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", FACEVERIFY_PATH)
            .expect(0)
            .create_async()
            .await;

        let err = store(&server).fetch("   ").await.unwrap_err();
        assert!(matches!(err, AcquisitionError::EmptyIdentifier));
        mock.assert_async().await;
    }
}
