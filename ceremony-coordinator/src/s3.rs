//! Object storage behind the coordinator: bucket lifecycle, presigned
//! URLs, multipart uploads, and the bit-stable path conventions the rest of
//! the ecosystem depends on.

use crate::objects::ChunkTag;
use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, CorsConfiguration, CorsRule, ObjectCannedAcl,
};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("blob store failed: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Access level requested when opening an upload.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ObjectAcl {
    Private,
    PublicRead,
}

/// The blob-store operations the coordinator consumes. Implementations must
/// report a missing object through [`BlobError::NotFound`], distinct from
/// permission or transport failures.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates the ceremony bucket with its access policy and CORS rules
    /// (public read on non-contribution artifacts, `ETag` exposed for
    /// multipart clients). Succeeds if the bucket already exists.
    async fn create_bucket(&self, bucket: &str) -> Result<(), BlobError>;

    /// Fails with [`BlobError::NotFound`] when the object does not exist.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<(), BlobError>;

    async fn presigned_get_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, BlobError>;

    /// Opens a multipart upload and returns its upload id.
    async fn open_multipart(
        &self,
        bucket: &str,
        key: &str,
        acl: ObjectAcl,
    ) -> Result<String, BlobError>;

    async fn presigned_part_url(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, BlobError>;

    /// Completes a multipart upload. Idempotent for a repeated
    /// `(upload_id, parts)` tuple.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[ChunkTag],
    ) -> Result<(), BlobError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BlobError>;

    async fn upload_from_string(
        &self,
        bucket: &str,
        key: &str,
        body: String,
    ) -> Result<(), BlobError>;

    async fn download_to_path(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), BlobError>;
}

//
// -- PATH CONVENTIONS --
//

/// `<ceremonyPrefix><bucketPostfix>`.
pub fn bucket_name(ceremony_prefix: &str, bucket_postfix: &str) -> String {
    format!("{}{}", ceremony_prefix, bucket_postfix)
}

/// `circuits/<circuitPrefix>/contributions/<circuitPrefix>_<zkeyIndex>.zkey`.
pub fn zkey_key(circuit_prefix: &str, zkey_index: &str) -> String {
    format!(
        "circuits/{0}/contributions/{0}_{1}.zkey",
        circuit_prefix, zkey_index
    )
}

/// `circuits/<circuitPrefix>/transcripts/<circuitPrefix>_<zkeyIndex>_<identifier>_verification_transcript.log`.
pub fn transcript_key(circuit_prefix: &str, zkey_index: &str, identifier: &str) -> String {
    format!(
        "circuits/{0}/transcripts/{0}_{1}_{2}_verification_transcript.log",
        circuit_prefix, zkey_index, identifier
    )
}

/// `pot/<potFilename>`.
pub fn pot_key(pot_filename: &str) -> String {
    format!("pot/{}", pot_filename)
}

/// `circuits/<circuitName>/<bootstrapScriptFilename>`.
pub fn bootstrap_script_key(circuit_name: &str, script_filename: &str) -> String {
    format!("circuits/{}/{}", circuit_name, script_filename)
}

/// Returns `true` for keys in the private contribution namespace.
pub fn is_contribution_key(key: &str) -> bool {
    key.contains("/contributions/")
}

//
// -- S3 ADAPTER --
//

/// [`BlobStore`] adapter over an S3-compatible object store.
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Builds the adapter from the ambient AWS configuration (environment
    /// variables, instance profile, ...).
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config))
    }

    fn presigning(ttl: Duration) -> Result<PresigningConfig, BlobError> {
        PresigningConfig::expires_in(ttl).map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))
    }

    /// Public read on everything except the contribution namespace, which
    /// stays private to the uploading contributor's presigned URLs.
    fn public_read_policy(bucket: &str) -> String {
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "PublicReadNonContribution",
                "Effect": "Allow",
                "Principal": "*",
                "Action": "s3:GetObject",
                "Resource": [
                    format!("arn:aws:s3:::{}/pot/*", bucket),
                    format!("arn:aws:s3:::{}/circuits/*/transcripts/*", bucket),
                ],
            }]
        })
        .to_string()
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn create_bucket(&self, bucket: &str) -> Result<(), BlobError> {
        if let Err(error) = self.client.create_bucket().bucket(bucket).send().await {
            let service_error = error.into_service_error();
            if !service_error.is_bucket_already_owned_by_you() {
                return Err(BlobError::Backend(anyhow::anyhow!(service_error)));
            }
        }

        self.client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(Self::public_read_policy(bucket))
            .send()
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;

        let cors_rule = CorsRule::builder()
            .allowed_methods("GET")
            .allowed_methods("PUT")
            .allowed_origins("*")
            .allowed_headers("*")
            .expose_headers("ETag")
            .build()
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        let cors = CorsConfiguration::builder()
            .cors_rules(cors_rule)
            .build()
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        self.client
            .put_bucket_cors()
            .bucket(bucket)
            .cors_configuration(cors)
            .send()
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;

        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                let service_error = error.into_service_error();
                if service_error.is_not_found() {
                    Err(BlobError::NotFound(key.to_string()))
                } else {
                    Err(BlobError::Backend(anyhow::anyhow!(service_error)))
                }
            }
        }
    }

    async fn presigned_get_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        Ok(request.uri().to_string())
    }

    async fn open_multipart(
        &self,
        bucket: &str,
        key: &str,
        acl: ObjectAcl,
    ) -> Result<String, BlobError> {
        let canned = match acl {
            ObjectAcl::Private => ObjectCannedAcl::Private,
            ObjectAcl::PublicRead => ObjectCannedAcl::PublicRead,
        };
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .acl(canned)
            .send()
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| BlobError::Backend(anyhow::anyhow!("multipart open returned no upload id")))
    }

    async fn presigned_part_url(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        let request = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        Ok(request.uri().to_string())
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[ChunkTag],
    ) -> Result<(), BlobError> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|chunk| {
                CompletedPart::builder()
                    .e_tag(&chunk.etag)
                    .part_number(chunk.part_number as i32)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn upload_from_string(
        &self,
        bucket: &str,
        key: &str,
        body: String,
    ) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body.into_bytes().into())
            .send()
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn download_to_path(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?
            .into_bytes();
        tokio::fs::write(destination, &bytes)
            .await
            .map_err(|e| BlobError::Backend(anyhow::anyhow!(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_paths_are_bit_stable() {
        assert_eq!(bucket_name("p1", "-ceremony"), "p1-ceremony");
        assert_eq!(
            zkey_key("mult2", "00001"),
            "circuits/mult2/contributions/mult2_00001.zkey"
        );
        assert_eq!(
            transcript_key("mult2", "00001", "alice"),
            "circuits/mult2/transcripts/mult2_00001_alice_verification_transcript.log"
        );
        assert_eq!(pot_key("pot12_final.ptau"), "pot/pot12_final.ptau");
        assert_eq!(
            bootstrap_script_key("mult2", "bootstrap.sh"),
            "circuits/mult2/bootstrap.sh"
        );
    }

    #[test]
    fn contribution_namespace_is_detected() {
        assert!(is_contribution_key(zkey_key("c", "00001").as_str()));
        assert!(!is_contribution_key(pot_key("pot.ptau").as_str()));
        assert!(!is_contribution_key(
            transcript_key("c", "00001", "alice").as_str()
        ));
    }
}
