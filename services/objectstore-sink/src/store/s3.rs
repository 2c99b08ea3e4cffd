use super::{content_type, ObjectStore};
use crate::config::S3Config;
use crate::error::{SinkError, StoreError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

/// Error codes S3 uses for throttling and transient server-side trouble
const RETRYABLE_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

/// S3 backend with multipart upload for large files
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 store
    pub async fn new(config: &S3Config) -> Result<Self, SinkError> {
        if config.bucket.is_empty() {
            return Err(SinkError::Config("storage.bucket must not be empty".into()));
        }
        if config.part_size_bytes < 5 * 1024 * 1024 {
            return Err(SinkError::Config(
                "storage.part_size_bytes must be at least 5MB".into(),
            ));
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type(key))
            .send()
            .await
            .map_err(|e| classify("put object", e))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type(key))
            .send()
            .await
            .map_err(|e| classify("create multipart upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StoreError::Retryable("no upload id in response".into()))?
            .to_string();

        // Dropping this future mid-upload (attempt timeout, shutdown) still
        // aborts the upload in the background
        let guard = AbortOnDrop::new({
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            move || match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        abort_upload(&client, &bucket, &key, &upload_id).await;
                    });
                }
                Err(_) => warn!(
                    key = %key,
                    upload_id = %upload_id,
                    "No runtime left to abort interrupted multipart upload"
                ),
            }
        });

        let result = self.upload_parts(key, &upload_id, body).await;
        guard.disarm();
        if result.is_err() {
            // The next attempt starts over with a fresh upload id
            abort_upload(&self.client, &self.bucket, key, &upload_id).await;
        }
        result
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, body: Bytes) -> Result<(), StoreError> {
        let part_size = self.config.part_size_bytes;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < body.len() {
            let end = usize::min(offset + part_size, body.len());
            let chunk = body.slice(offset..end);

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| classify("upload part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
            offset = end;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| classify("complete multipart upload", e))?;

        Ok(())
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        debug!(key = %key, "Uploading object to S3");

        if body.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body).await
        } else {
            self.simple_upload(key, body).await
        }
    }
}

async fn abort_upload(client: &S3Client, bucket: &str, key: &str, upload_id: &str) {
    match client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await
    {
        Ok(_) => debug!(key = %key, upload_id = %upload_id, "Aborted multipart upload"),
        Err(e) => warn!(
            key = %key,
            upload_id = %upload_id,
            error = %DisplayErrorContext(&e),
            "Failed to abort multipart upload"
        ),
    }
}

/// Runs `abort` on drop unless disarmed first
struct AbortOnDrop<F: FnOnce()> {
    abort: Option<F>,
}

impl<F: FnOnce()> AbortOnDrop<F> {
    fn new(abort: F) -> Self {
        Self { abort: Some(abort) }
    }

    fn disarm(mut self) {
        self.abort = None;
    }
}

impl<F: FnOnce()> Drop for AbortOnDrop<F> {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort();
        }
    }
}

/// Split SDK failures into retryable and terminal ones
fn classify<E>(action: &str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}: {}", action, DisplayErrorContext(&err));

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Retryable(message)
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code().unwrap_or_default();
            if is_retryable_status(status) || RETRYABLE_CODES.contains(&code) {
                StoreError::Retryable(message)
            } else {
                StoreError::Terminal(message)
            }
        }
        _ => StoreError::Terminal(message),
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}
