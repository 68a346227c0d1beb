//! Bucket provisioning shared by the S3, IBM COS and OSS drivers

use crate::crd::{
    ConditionStatus, ImageRegistryConfig, CONDITION_STORAGE_ENCRYPTED, CONDITION_STORAGE_EXISTS,
    CONDITION_STORAGE_PUBLIC_ACCESS_BLOCKED, CONDITION_STORAGE_TAGGED,
    CONDITION_STORAGE_UPLOAD_CLEANUP,
};
use crate::domain::{BucketApi, BucketEncryption};
use crate::error::{CloudErrorKind, Error, Result};
use crate::storage::mark_not_configured;
use crate::storage::naming::NamePolicy;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Days after which incomplete multipart uploads are aborted
pub(crate) const ABORT_MULTIPART_DAYS: u32 = 1;

/// How a bucket came to be usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BucketOutcome {
    /// The named bucket already existed
    Adopted,
    /// The operator created it
    Created,
}

/// Check a bucket and set `StorageExists` accordingly
pub(crate) async fn bucket_exists(
    api: &dyn BucketApi,
    cr: &mut ImageRegistryConfig,
    bucket: &str,
) -> Result<bool> {
    if bucket.is_empty() {
        mark_not_configured(cr, "Bucket");
        return Ok(false);
    }

    match api.head_bucket(bucket).await {
        Ok(()) => {
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::True,
                "BucketExists",
                format!("Bucket {} exists", bucket),
            );
            Ok(true)
        }
        Err(e) if e.is_not_found() => {
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::False,
                "BucketDoesNotExist",
                format!("Bucket {} does not exist", bucket),
            );
            Ok(false)
        }
        Err(e) => {
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::Unknown,
                e.reason(),
                e.to_string(),
            );
            Err(e)
        }
    }
}

/// Make `bucket` usable, generating a name when it is empty.
///
/// A user supplied name is adopted when reachable and created verbatim
/// otherwise. A generated name is retried on collisions up to the policy's
/// attempt bound; any other error aborts the pass.
pub(crate) async fn ensure_bucket(
    api: &dyn BucketApi,
    cr: &mut ImageRegistryConfig,
    bucket: &mut String,
    prefix: &str,
    region: &str,
    policy: &NamePolicy,
) -> Result<BucketOutcome> {
    if !bucket.is_empty() {
        return ensure_named_bucket(api, cr, bucket, region).await;
    }

    for attempt in 1..=policy.attempts {
        let candidate = policy.generate(prefix);
        match api.create_bucket(&candidate, region).await {
            Ok(()) => {
                info!(bucket = %candidate, attempt, "created bucket");
                *bucket = candidate;
                return Ok(BucketOutcome::Created);
            }
            Err(Error::Cloud {
                kind: CloudErrorKind::AlreadyOwned,
                ..
            }) => {
                *bucket = candidate;
                return Ok(BucketOutcome::Created);
            }
            Err(Error::Cloud {
                kind: CloudErrorKind::AlreadyExists,
                ..
            }) => {
                debug!(bucket = %candidate, attempt, "bucket name taken, retrying");
                continue;
            }
            Err(e) => {
                cr.set_condition(
                    CONDITION_STORAGE_EXISTS,
                    ConditionStatus::False,
                    e.reason(),
                    e.to_string(),
                );
                return Err(e);
            }
        }
    }

    let err = Error::NameGenerationExhausted {
        kind: policy.kind.to_string(),
        attempts: policy.attempts,
    };
    cr.set_condition(
        CONDITION_STORAGE_EXISTS,
        ConditionStatus::False,
        err.reason(),
        err.to_string(),
    );
    Err(err)
}

async fn ensure_named_bucket(
    api: &dyn BucketApi,
    cr: &mut ImageRegistryConfig,
    bucket: &str,
    region: &str,
) -> Result<BucketOutcome> {
    match api.head_bucket(bucket).await {
        Ok(()) => return Ok(BucketOutcome::Adopted),
        Err(e) if e.is_not_found() => {}
        Err(Error::Cloud {
            kind: CloudErrorKind::AccessDenied,
            message,
            ..
        }) => return Err(unavailable(cr, bucket, &message)),
        Err(e) => return Err(e),
    }

    match api.create_bucket(bucket, region).await {
        Ok(()) => {
            info!(bucket, "created bucket");
            Ok(BucketOutcome::Created)
        }
        Err(Error::Cloud {
            kind: CloudErrorKind::AlreadyOwned,
            ..
        }) => Ok(BucketOutcome::Created),
        Err(Error::Cloud {
            kind: CloudErrorKind::AlreadyExists | CloudErrorKind::AccessDenied,
            message,
            ..
        }) => Err(unavailable(cr, bucket, &message)),
        Err(e) => Err(e),
    }
}

fn unavailable(cr: &mut ImageRegistryConfig, bucket: &str, message: &str) -> Error {
    let err = Error::StorageUnavailable {
        kind: "bucket".to_string(),
        name: bucket.to_string(),
        reason: format!("already exists but is not accessible: {}", message),
    };
    cr.set_condition(
        CONDITION_STORAGE_EXISTS,
        ConditionStatus::False,
        "Unavailable",
        err.to_string(),
    );
    err
}

/// Hardening applied to buckets the operator owns
pub(crate) struct BucketHardening<'a> {
    pub tags: &'a BTreeMap<String, String>,
    pub encryption: Option<BucketEncryption>,
}

/// Tag, encrypt and lock down a managed bucket, one condition per step
pub(crate) async fn harden_bucket(
    api: &dyn BucketApi,
    cr: &mut ImageRegistryConfig,
    bucket: &str,
    hardening: BucketHardening<'_>,
) -> Result<()> {
    step(
        cr,
        CONDITION_STORAGE_TAGGED,
        "Tagged",
        "TaggingFailed",
        api.put_tags(bucket, hardening.tags).await,
    )?;

    if let Some(encryption) = &hardening.encryption {
        step(
            cr,
            CONDITION_STORAGE_ENCRYPTED,
            "Encrypted",
            "EncryptionFailed",
            api.put_encryption(bucket, encryption).await,
        )?;
    }

    step(
        cr,
        CONDITION_STORAGE_UPLOAD_CLEANUP,
        "CleanupEnabled",
        "CleanupFailed",
        api.put_abort_multipart_rule(bucket, ABORT_MULTIPART_DAYS).await,
    )?;

    step(
        cr,
        CONDITION_STORAGE_PUBLIC_ACCESS_BLOCKED,
        "PublicAccessBlocked",
        "PublicAccessBlockFailed",
        api.block_public_access(bucket).await,
    )
}

fn step(
    cr: &mut ImageRegistryConfig,
    condition: &str,
    ok_reason: &str,
    failed_reason: &str,
    result: Result<()>,
) -> Result<()> {
    match result {
        Ok(()) => {
            cr.set_condition(condition, ConditionStatus::True, ok_reason, "");
            Ok(())
        }
        Err(e) => {
            cr.set_condition(condition, ConditionStatus::False, failed_reason, e.to_string());
            Err(e)
        }
    }
}

/// Delete a bucket, treating absence as success
pub(crate) async fn delete_bucket(api: &dyn BucketApi, bucket: &str) -> Result<()> {
    match api.delete_bucket(bucket).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
