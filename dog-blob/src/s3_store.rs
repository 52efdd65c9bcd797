use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use base64::Engine;
use bytes::Bytes;

use crate::{
    BlobError, BlobResult, ByteRange, GetResult, MultipartOptions, MultipartUpload, ObjectHead, ObjectStore,
    PutResult, Sha256Digest, UploadedPart,
};

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Custom endpoint (R2, MinIO, RustFS...). Enables path-style addressing.
    pub fn with_endpoint(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self.force_path_style = true;
        self
    }

    pub fn with_credentials(mut self, access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }
}

/// `ObjectStore` backed by the AWS SDK (S3-compatible)
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) = (config.access_key_id, config.secret_access_key) {
            let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "dog-blob");
            loader = loader.credentials_provider(credentials);
        }
        if let Some(endpoint_url) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        let aws_config = loader.load().await;
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.force_path_style)
                .build(),
        );

        Self {
            client,
            bucket: config.bucket,
        }
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(se) if se.raw().status().as_u16() == 404)
}

fn error_code<E: ProvideErrorMetadata>(err: &SdkError<E>) -> Option<&str> {
    match err {
        SdkError::ServiceError(se) => se.err().code(),
        _ => None,
    }
}

/// Map SDK failures onto the storage error taxonomy.
fn map_sdk_error<E>(err: SdkError<E>, key: &str, upload_id: Option<&str>) -> BlobError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match error_code(&err) {
        Some("NoSuchUpload") => {
            return BlobError::no_such_upload(key, upload_id.unwrap_or_default());
        }
        Some("BadDigest") | Some("XAmzContentSHA256Mismatch") | Some("InvalidDigest") => {
            return BlobError::checksum_mismatch(key);
        }
        Some("NoSuchKey") => return BlobError::not_found(key),
        _ => {}
    }
    tracing::warn!(key = %key, error = %err, "S3 request failed");
    BlobError::backend(err)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head(&self, key: &str) -> BlobResult<Option<ObjectHead>> {
        let output = match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(map_sdk_error(err, key, None)),
        };

        let custom_metadata: BTreeMap<String, String> = output
            .metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(Some(ObjectHead {
            size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
            etag: output.e_tag().map(str::to_string),
            custom_metadata,
        }))
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> BlobResult<Option<GetResult>> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = &range {
            request = request.range(range.to_header());
        }

        let output = match request.send().await {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(map_sdk_error(err, key, None)),
        };

        let size_bytes = output.content_length().unwrap_or(0).max(0) as u64;
        let etag = output.e_tag().map(str::to_string);
        let mut body = output.body;
        let stream = async_stream::stream! {
            while let Some(chunk) = body.next().await {
                yield chunk.map_err(std::io::Error::other);
            }
        };

        Ok(Some(GetResult {
            stream: Box::pin(stream),
            size_bytes,
            etag,
        }))
    }

    async fn put(&self, key: &str, data: Bytes, checksum: Option<Sha256Digest>) -> BlobResult<PutResult> {
        let size_bytes = data.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into());

        if let Some(checksum) = checksum {
            request = request.checksum_sha256(base64::engine::general_purpose::STANDARD.encode(checksum));
        }

        let output = request.send().await.map_err(|e| map_sdk_error(e, key, None))?;
        Ok(PutResult {
            etag: output.e_tag().map(str::to_string),
            size_bytes,
        })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key, None))?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        options: MultipartOptions,
    ) -> BlobResult<Box<dyn MultipartUpload>> {
        let mut request = self.client.create_multipart_upload().bucket(&self.bucket).key(key);
        for (name, value) in options.custom_metadata {
            request = request.metadata(name, value);
        }

        let output = request.send().await.map_err(|e| map_sdk_error(e, key, None))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| BlobError::invalid("S3 did not return upload_id"))?;

        Ok(self.resume_multipart_upload(key, upload_id))
    }

    fn resume_multipart_upload(&self, key: &str, upload_id: &str) -> Box<dyn MultipartUpload> {
        Box::new(S3MultipartUpload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }
}

struct S3MultipartUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
}

#[async_trait]
impl MultipartUpload for S3MultipartUpload {
    fn key(&self) -> &str {
        &self.key
    }

    fn upload_id(&self) -> &str {
        &self.upload_id
    }

    async fn upload_part(&self, part_number: u32, data: Bytes) -> BlobResult<UploadedPart> {
        let number = i32::try_from(part_number)
            .map_err(|_| BlobError::invalid(format!("part number {part_number} out of range")))?;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key, Some(&self.upload_id)))?;

        Ok(UploadedPart {
            part_number,
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete(&self, parts: Vec<UploadedPart>) -> BlobResult<PutResult> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .e_tag(&p.etag)
                    .part_number(p.part_number as i32)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(completed)).build())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key, Some(&self.upload_id)))?;

        Ok(PutResult {
            etag: output.e_tag().map(str::to_string),
            size_bytes: 0,
        })
    }

    async fn abort(&self) -> BlobResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key, Some(&self.upload_id)))?;
        Ok(())
    }
}
