use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::debug;

use super::UploadError;

/// A part accepted by the remote store, needed to finish a multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// The object-storage operations the uploader needs.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), UploadError>;

    /// Starts a multipart upload and returns its upload id.
    async fn create_multipart(&self, key: &str) -> Result<String, UploadError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, UploadError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), UploadError>;

    /// Used by upload confirmation to check the object actually landed.
    async fn object_exists(&self, key: &str) -> Result<bool, UploadError>;
}

/// S3 / MinIO transport.
#[derive(Clone)]
pub struct S3Transport {
    client: S3Client,
    bucket: String,
}

impl S3Transport {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

fn s3_err(op: &str, e: impl std::fmt::Display) -> UploadError {
    UploadError::Transport(format!("S3 {op} failed: {e}"))
}

#[async_trait]
impl UploadTransport for S3Transport {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), UploadError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| s3_err("PutObject", e))?;
        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, UploadError> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_err("CreateMultipartUpload", e))?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| UploadError::Transport("S3 returned no upload id".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, UploadError> {
        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| s3_err("UploadPart", e))?;
        Ok(UploadedPart {
            part_number,
            etag: out.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), UploadError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(&p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| s3_err("CompleteMultipartUpload", e))?;
        debug!(
            "Completed multipart upload of s3://{}/{} ({} parts)",
            self.bucket,
            key,
            parts.len()
        );
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool, UploadError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(false)
                } else {
                    Err(s3_err("HeadObject", e))
                }
            }
        }
    }
}
