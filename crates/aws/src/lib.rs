use anyhow::Result;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::types::{Grant, ServerSideEncryptionRule};
use aws_sdk_s3::Client;

use s3comply_core::{AclGrant, BucketInspector, EncryptionRule};

/// Service error code S3 returns when a bucket has no policy attached.
pub const NO_SUCH_BUCKET_POLICY: &str = "NoSuchBucketPolicy";

/// Region-bound S3 client answering the compliance queries.
#[derive(Debug, Clone)]
pub struct S3Inspector { client: Client }

impl S3Inspector {
    /// Loads credentials from the default provider chain and pins the region.
    pub async fn connect(region: &str, endpoint: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(url) = endpoint { loader = loader.endpoint_url(url); }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if endpoint.is_some() { builder = builder.force_path_style(true); }
        Self { client: Client::from_conf(builder.build()) }
    }
}

fn sdk_err(op: &str, bucket: &str, e: impl std::error::Error) -> anyhow::Error {
    anyhow::anyhow!("{op} on bucket '{bucket}': {}", DisplayErrorContext(e))
}

fn to_rule(rule: &ServerSideEncryptionRule) -> EncryptionRule {
    let by_default = rule.apply_server_side_encryption_by_default();
    EncryptionRule {
        default_algorithm: by_default.map(|d| d.sse_algorithm().as_str().to_string()),
        kms_master_key_id: by_default.and_then(|d| d.kms_master_key_id()).map(str::to_string),
    }
}

fn to_grant(grant: &Grant) -> AclGrant {
    let grantee = grant.grantee();
    AclGrant {
        grantee_type: grantee.map(|g| g.r#type().as_str().to_string()).unwrap_or_default(),
        grantee_uri: grantee.and_then(|g| g.uri()).map(str::to_string),
        permission: grant.permission().map(|p| p.as_str().to_string()),
    }
}

#[async_trait]
impl BucketInspector for S3Inspector {
    async fn encryption_rules(&self, bucket: &str) -> Result<Vec<EncryptionRule>> {
        let out = self.client.get_bucket_encryption().bucket(bucket).send().await
            .map_err(|e| sdk_err("GetBucketEncryption", bucket, e))?;
        Ok(out.server_side_encryption_configuration()
            .map(|c| c.rules().iter().map(to_rule).collect())
            .unwrap_or_default())
    }

    async fn acl_grants(&self, bucket: &str) -> Result<Vec<AclGrant>> {
        let out = self.client.get_bucket_acl().bucket(bucket).send().await
            .map_err(|e| sdk_err("GetBucketAcl", bucket, e))?;
        Ok(out.grants().iter().map(to_grant).collect())
    }

    async fn policy_is_public(&self, bucket: &str) -> Result<Option<bool>> {
        match self.client.get_bucket_policy_status().bucket(bucket).send().await {
            Ok(out) => Ok(Some(out.policy_status().and_then(|s| s.is_public()).unwrap_or(false))),
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some(NO_SUCH_BUCKET_POLICY) => {
                tracing::debug!(bucket, "bucket has no policy");
                Ok(None)
            }
            Err(e) => Err(sdk_err("GetBucketPolicyStatus", bucket, e)),
        }
    }

    async fn policy_document(&self, bucket: &str) -> Result<Option<String>> {
        match self.client.get_bucket_policy().bucket(bucket).send().await {
            Ok(out) => Ok(out.policy().map(str::to_string)),
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some(NO_SUCH_BUCKET_POLICY) => Ok(None),
            Err(e) => Err(sdk_err("GetBucketPolicy", bucket, e)),
        }
    }

    async fn versioning_status(&self, bucket: &str) -> Result<Option<String>> {
        let out = self.client.get_bucket_versioning().bucket(bucket).send().await
            .map_err(|e| sdk_err("GetBucketVersioning", bucket, e))?;
        Ok(out.status().map(|s| s.as_str().to_string()))
    }
}
