//! Error types for chronoshard

/// Result type alias for chronoshard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for chronoshard
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Node not found
    #[error("node not found")]
    NodeNotFound,
    /// Database not found
    #[error("database not found: {0}")]
    DatabaseNotFound(String),
    /// Retention policy not found
    #[error("retention policy not found: {0}")]
    RetentionPolicyNotFound(String),
    /// Shard group not found
    #[error("shard group not found")]
    ShardGroupNotFound,
    /// Shard not found
    #[error("shard not found: {0}")]
    ShardNotFound(u64),
    /// Subscription not found
    #[error("subscription not found")]
    SubscriptionNotFound,
    /// User not found
    #[error("user not found")]
    UserNotFound,

    /// Node already exists
    #[error("node already exists")]
    NodeExists,
    /// Database already exists
    #[error("database already exists")]
    DatabaseExists,
    /// Retention policy already exists
    #[error("retention policy already exists")]
    RetentionPolicyExists,
    /// Retention policy rename collides with another policy
    #[error("retention policy name already exists")]
    RetentionPolicyNameExists,
    /// Retention policy conflicts with an existing policy
    #[error("retention policy conflicts with an existing policy")]
    RetentionPolicyConflict,
    /// User already exists
    #[error("user already exists")]
    UserExists,
    /// Subscription already exists
    #[error("subscription already exists")]
    SubscriptionExists,
    /// Continuous query already exists
    #[error("continuous query already exists")]
    ContinuousQueryExists,

    /// Database name required
    #[error("database name required")]
    DatabaseNameRequired,
    /// Retention policy name required
    #[error("retention policy name required")]
    RetentionPolicyNameRequired,
    /// Username required
    #[error("username required")]
    UsernameRequired,
    /// Node ID required
    #[error("node id must be greater than 0")]
    NodeIdRequired,
    /// Database or retention policy name too long
    #[error("name is too long, it must be less than 256 characters")]
    NameTooLong,
    /// Name is empty, non-printable, or contains path separators
    #[error("invalid name: {0}")]
    InvalidName(String),
    /// Replication factor below one
    #[error("replication factor must be greater than 0")]
    ReplicationFactorTooLow,
    /// Retention duration shorter than the shard group duration
    #[error("retention policy duration must be greater than the shard duration")]
    IncompatibleDurations,
    /// Retention duration below the minimum
    #[error("retention policy duration must be at least 1h0m0s")]
    RetentionPolicyDurationTooLow,
    /// Subscription destination URL failed validation
    #[error("invalid subscription URL: {0}")]
    InvalidSubscriptionUrl(String),
    /// Too many meta nodes for a single-node set operation
    #[error("can't set meta node when there are more than 1 in the metastore")]
    TooManyMetaNodes,
    /// Orphaned shard could not be reassigned
    #[error("cannot reassign shard {0} due to lack of data nodes")]
    ShardReassignFailed(u64),
    /// Imported metadata is missing the requested database
    #[error("imported metadata does not have database named {0}")]
    ImportDatabaseMissing(String),

    /// A write did not complete before the write timeout
    #[error("timeout")]
    Timeout,
    /// A write succeeded on some owners but did not meet the consistency level
    #[error("partial write")]
    PartialWrite,
    /// Some points were dropped, the rest were written
    #[error("partial write: {reason} dropped={dropped}")]
    PartialWriteDropped { reason: String, dropped: usize },
    /// No writes succeeded
    #[error("write failed")]
    WriteFailed,
    /// No writes succeeded; carries the first per-owner error message
    #[error("write failed: {0}")]
    WriteFailedCause(String),
    /// Shard mapping produced no shard group for an in-range point
    #[error("nil shard group")]
    ShardGroupUnavailable,
    /// Shard is scheduled for deletion and accepts no writes
    #[error("shard is pending deletion")]
    ShardDeletion,
    /// Hinted handoff queue is at capacity
    #[error("queue is blocked")]
    QueueBlocked,
    /// Hinted handoff queue has pending data for this owner
    #[error("hinted handoff queue not empty")]
    HintedHandoffQueueNotEmpty,
    /// Another node holds the lease
    #[error("another node has the lease")]
    LeaseHeld { name: String, owner: u64 },

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
    /// IO errors
    #[error("io error: {0}")]
    Io(String),
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
