use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! operations {
    ($($variant:ident => $name:literal,)+) => {
        /// Storage API action that produced an event.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub enum OperationId {
            $($variant,)+
        }

        impl OperationId {
            /// Every known operation, in declaration order.
            pub const ALL: &'static [OperationId] = &[$(Self::$variant,)+];

            /// Wire name of the operation.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl FromStr for OperationId {
            type Err = UnknownOperation;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(UnknownOperation(other.to_string())),
                }
            }
        }
    };
}

operations! {
    AbortMultipartUpload => "abortMultipartUpload",
    CompleteMultipartUpload => "completeMultipartUpload",
    CopyObject => "copyObject",
    CreateBucket => "createBucket",
    DeleteBucket => "deleteBucket",
    DeleteBucketCors => "deleteBucketCors",
    DeleteBucketEncryption => "deleteBucketEncryption",
    DeleteBucketLifecycle => "deleteBucketLifecycle",
    DeleteBucketReplication => "deleteBucketReplication",
    DeleteBucketTagging => "deleteBucketTagging",
    DeleteBucketWebsite => "deleteBucketWebsite",
    DeleteObject => "deleteObject",
    DeleteObjectTagging => "deleteObjectTagging",
    GetBucketAcl => "getBucketAcl",
    GetBucketCors => "getBucketCors",
    GetBucketEncryption => "getBucketEncryption",
    GetBucketLifecycle => "getBucketLifecycle",
    GetBucketLocation => "getBucketLocation",
    GetBucketNotification => "getBucketNotification",
    GetBucketObjectLock => "getBucketObjectLock",
    GetBucketReplication => "getBucketReplication",
    GetBucketVersioning => "getBucketVersioning",
    GetBucketTagging => "getBucketTagging",
    GetBucketWebsite => "getBucketWebsite",
    GetObject => "getObject",
    GetObjectAcl => "getObjectAcl",
    GetObjectLegalHold => "getObjectLegalHold",
    GetObjectRetention => "getObjectRetention",
    GetObjectTagging => "getObjectTagging",
    HeadBucket => "headBucket",
    HeadObject => "headObject",
    InitiateMultipartUpload => "initiateMultipartUpload",
    ListBucket => "listBucket",
    ListMultipartUploadParts => "listMultipartUploadParts",
    ListMultipartUploads => "listMultipartUploads",
    ManualAdjustment => "manualAdjustment",
    MultiObjectDelete => "multiObjectDelete",
    PutBucketAcl => "putBucketAcl",
    PutBucketCors => "putBucketCors",
    PutBucketEncryption => "putBucketEncryption",
    PutBucketLifecycle => "putBucketLifecycle",
    PutBucketNotification => "putBucketNotification",
    PutBucketObjectLock => "putBucketObjectLock",
    PutBucketReplication => "putBucketReplication",
    PutBucketVersioning => "putBucketVersioning",
    PutBucketTagging => "putBucketTagging",
    PutBucketWebsite => "putBucketWebsite",
    PutDeleteMarkerObject => "putDeleteMarkerObject",
    PutObject => "putObject",
    PutObjectAcl => "putObjectAcl",
    PutObjectLegalHold => "putObjectLegalHold",
    PutObjectRetention => "putObjectRetention",
    PutObjectTagging => "putObjectTagging",
    ReplicateDelete => "replicateDelete",
    ReplicateObject => "replicateObject",
    ReplicateTags => "replicateTags",
    UploadPart => "uploadPart",
    UploadPartCopy => "uploadPartCopy",
}

impl OperationId {
    /// Operation recorded in the durable store for this action.
    ///
    /// Delete markers count as deletes.
    pub const fn normalize(self) -> Self {
        match self {
            Self::PutDeleteMarkerObject => Self::DeleteObject,
            other => other,
        }
    }
}

impl OperationId {
    /// Whether the event stands for a storage API request. Operator
    /// adjustments carry deltas but are not counted as operations.
    pub const fn is_request(self) -> bool {
        !matches!(self, Self::ManualAdjustment)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an operation name that is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);
