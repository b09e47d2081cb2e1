//! AWS S3 multipart store.
//!
//! Talks to any S3-compatible endpoint through the AWS SDK for Rust.
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless static keys
//! are configured.
//!
//! The SDK's own retry layer is disabled: the engine owns the retry
//! policy, and every SDK error is classified into an [`UploadError`].

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{
    ListedPart, MultipartStore, ObjectLocation, ObjectMetadata, StoreFuture, StoredObjectInfo,
    UploadSummary,
};
use crate::config::AwsStorageConfig;
use crate::errors::{classify_service_error, UploadError};

/// Multipart store backed by an S3-compatible service.
#[derive(Debug, Clone)]
pub struct AwsStore {
    /// AWS S3 SDK client.
    client: Client,
}

impl AwsStore {
    /// Create a new S3 store.
    ///
    /// `call_timeout` bounds every individual request attempt.
    pub async fn new(config: &AwsStorageConfig, call_timeout: Duration) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_attempt_timeout(call_timeout)
                    .build(),
            );

        if !config.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&config.endpoint_url);
        }

        // If explicit credentials are provided, inject them as static credentials.
        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None, // session_token
                None, // expiry
                "bleepload-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        } else if !config.access_key_id.is_empty() || !config.secret_access_key.is_empty() {
            anyhow::bail!("storage.aws needs both access_key_id and secret_access_key");
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.use_path_style)
            .build();

        info!(
            "S3 client initialized: region={} endpoint='{}' path_style={}",
            config.region, config.endpoint_url, config.use_path_style
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
        })
    }

    /// Wrap an existing SDK client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Map an AWS SDK error to a classified upload error.
    fn map_sdk_error<E>(
        operation: &'static str,
        err: SdkError<E, HttpResponse>,
        session_id: Option<&str>,
    ) -> UploadError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let message = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                UploadError::Transient { operation, message }
            }
            SdkError::ServiceError(_) => {
                let status = err.raw_response().map(|r| r.status().as_u16());
                classify_service_error(operation, err.code(), status, message, session_id)
            }
            _ => UploadError::Rejected { operation, message },
        }
    }

    fn sdk_part_number(part_number: u32) -> Result<i32, UploadError> {
        i32::try_from(part_number).map_err(|_| UploadError::Rejected {
            operation: "upload_part",
            message: format!("part number {part_number} does not fit the wire format"),
        })
    }

    fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
    }

    fn metadata_map(metadata: &ObjectMetadata) -> Option<std::collections::HashMap<String, String>> {
        if metadata.user.is_empty() {
            None
        } else {
            Some(metadata.user.clone())
        }
    }
}

impl MultipartStore for AwsStore {
    fn create_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        metadata: &'a ObjectMetadata,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            debug!("S3 create_multipart_upload: {}", location);

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&location.bucket)
                .key(&location.key)
                .set_content_type(metadata.content_type.clone())
                .set_metadata(Self::metadata_map(metadata))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("create_multipart_upload", e, None))?;

            resp.upload_id()
                .map(str::to_string)
                .ok_or_else(|| UploadError::Internal(anyhow::anyhow!("S3 did not return an upload id")))
        })
    }

    fn upload_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        part_number: u32,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            debug!(
                "S3 upload_part: {} upload={} part={} bytes={}",
                location,
                upload_id,
                part_number,
                data.len()
            );

            let resp = self
                .client
                .upload_part()
                .bucket(&location.bucket)
                .key(&location.key)
                .upload_id(upload_id)
                .part_number(Self::sdk_part_number(part_number)?)
                .set_content_md5(content_md5)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("upload_part", e, Some(upload_id)))?;

            resp.e_tag().map(str::to_string).ok_or_else(|| {
                UploadError::transient("upload_part", "response carried no ETag")
            })
        })
    }

    fn list_parts<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Vec<ListedPart>> {
        Box::pin(async move {
            debug!("S3 list_parts: {} upload={}", location, upload_id);

            let mut listed = Vec::new();
            let mut marker: Option<String> = None;
            loop {
                let mut req = self
                    .client
                    .list_parts()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .upload_id(upload_id);
                if let Some(ref m) = marker {
                    req = req.part_number_marker(m);
                }

                let resp = req
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("list_parts", e, Some(upload_id)))?;

                for part in resp.parts() {
                    let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) else {
                        continue;
                    };
                    listed.push(ListedPart {
                        number: number.max(0) as u32,
                        etag: etag.to_string(),
                        size: part.size().unwrap_or(0).max(0) as u64,
                    });
                }

                if resp.is_truncated() == Some(true) {
                    marker = resp.next_part_number_marker().map(str::to_string);
                    if marker.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }

            listed.sort_by_key(|p| p.number);
            Ok(listed)
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        parts: &'a [(u32, String)],
    ) -> StoreFuture<'a, StoredObjectInfo> {
        Box::pin(async move {
            debug!(
                "S3 complete_multipart_upload: {} upload={} parts={}",
                location,
                upload_id,
                parts.len()
            );

            let mut completed = Vec::with_capacity(parts.len());
            for (number, etag) in parts {
                completed.push(
                    CompletedPart::builder()
                        .part_number(Self::sdk_part_number(*number)?)
                        .e_tag(etag)
                        .build(),
                );
            }

            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&location.bucket)
                .key(&location.key)
                .upload_id(upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("complete_multipart_upload", e, Some(upload_id))
                })?;

            Ok(StoredObjectInfo {
                etag: resp.e_tag().unwrap_or_default().to_string(),
                version_id: resp.version_id().map(str::to_string),
            })
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            debug!("S3 abort_multipart_upload: {} upload={}", location, upload_id);

            self.client
                .abort_multipart_upload()
                .bucket(&location.bucket)
                .key(&location.key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("abort_multipart_upload", e, Some(upload_id)))?;
            Ok(())
        })
    }

    fn list_multipart_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<UploadSummary>> {
        Box::pin(async move {
            debug!("S3 list_multipart_uploads: bucket={} prefix={}", bucket, prefix);

            let mut listed = Vec::new();
            let mut key_marker: Option<String> = None;
            let mut upload_id_marker: Option<String> = None;
            loop {
                let mut req = self.client.list_multipart_uploads().bucket(bucket);
                if !prefix.is_empty() {
                    req = req.prefix(prefix);
                }
                if let Some(ref m) = key_marker {
                    req = req.key_marker(m);
                }
                if let Some(ref m) = upload_id_marker {
                    req = req.upload_id_marker(m);
                }

                let resp = req
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("list_multipart_uploads", e, None))?;

                for upload in resp.uploads() {
                    let (Some(upload_id), Some(key)) = (upload.upload_id(), upload.key()) else {
                        continue;
                    };
                    listed.push(UploadSummary {
                        upload_id: upload_id.to_string(),
                        key: key.to_string(),
                        initiated: upload.initiated().and_then(Self::to_chrono),
                    });
                }

                if resp.is_truncated() == Some(true) {
                    key_marker = resp.next_key_marker().map(str::to_string);
                    upload_id_marker = resp.next_upload_id_marker().map(str::to_string);
                    if key_marker.is_none() && upload_id_marker.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }

            Ok(listed)
        })
    }

    fn put_object<'a>(
        &'a self,
        location: &'a ObjectLocation,
        data: Bytes,
        content_md5: Option<String>,
        metadata: &'a ObjectMetadata,
    ) -> StoreFuture<'a, StoredObjectInfo> {
        Box::pin(async move {
            debug!("S3 put_object: {} bytes={}", location, data.len());

            let resp = self
                .client
                .put_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .set_content_md5(content_md5)
                .set_content_type(metadata.content_type.clone())
                .set_metadata(Self::metadata_map(metadata))
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e, None))?;

            Ok(StoredObjectInfo {
                etag: resp.e_tag().unwrap_or_default().to_string(),
                version_id: resp.version_id().map(str::to_string),
            })
        })
    }
}

// -- Tests -------------------------------------------------------------------
