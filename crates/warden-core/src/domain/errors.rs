//! Errors - エラー型と分類
//!
//! Lease を取れなかった、というのはエラーではない（`AcquireOutcome` で表現する）。
//! ここに並ぶのは呼び出し側が分岐する必要のある失敗だけ。

use thiserror::Error;

use super::ids::JobId;

/// ErrorKind は実行エラーの運用分類
///
/// - Transient: 接続断・タイムアウト（store-access 層がリトライする）
/// - Conflict: 期待どおりの競合（別 worker / 別 coordinator が先行している）
/// - Permanent: リトライしても無意味
/// - Cancelled: shutdown による中断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Conflict,
    Permanent,
    Cancelled,
}

/// warden 全体のエラー型。運用上の分類は [`WardenError::kind`] で引く
#[derive(Debug, Error)]
pub enum WardenError {
    /// 接続断・タイムアウトなど、リトライで回復しうる store エラー
    #[error("transient store failure during {operation}: {message}")]
    TransientStore { operation: String, message: String },

    /// Enqueue rejected because an uncompleted group already exists.
    #[error("an active job group already exists for queue_type={queue_type}")]
    JobGroupConflict { queue_type: String },

    /// 古い version での complete / heartbeat（別 worker に再 claim された）
    #[error("stale version for {job_id}: expected {expected}, found {actual}")]
    StaleVersion {
        job_id: JobId,
        expected: i64,
        actual: i64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    /// A watchdog body or job handler failed.
    #[error("{0}")]
    Body(String),
}

impl WardenError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientStore {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn body(message: impl Into<String>) -> Self {
        Self::Body(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenError::TransientStore { .. } => ErrorKind::Transient,
            WardenError::JobGroupConflict { .. } | WardenError::StaleVersion { .. } => {
                ErrorKind::Conflict
            }
            WardenError::Cancelled => ErrorKind::Cancelled,
            WardenError::NotFound(_)
            | WardenError::InvalidState(_)
            | WardenError::Config(_)
            | WardenError::Body(_) => ErrorKind::Permanent,
        }
    }

    /// Whether the store-access layer should retry the call.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T, E = WardenError> = std::result::Result<T, E>;
