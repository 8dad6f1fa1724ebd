use thiserror::Error;

use crate::model::SourceTag;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient network failure from {source_tag}: {message}")]
    TransientNetwork { source_tag: SourceTag, message: String },

    #[error("{source_tag} unavailable after {attempts} attempts: {message}")]
    SourceUnavailable {
        source_tag: SourceTag,
        attempts: u32,
        message: String,
    },

    #[error("{source_tag} rate limited; resume after {wait_secs}s")]
    RateLimited { source_tag: SourceTag, wait_secs: u64 },

    #[error("malformed record from {source_tag}: {message}")]
    MalformedRecord { source_tag: SourceTag, message: String },

    #[error("unresolved identity {native_id:?} from {source_tag}")]
    UnresolvedIdentity { source_tag: SourceTag, native_id: String },

    #[error("integrity violation on {entity} {uid}: {message}")]
    IntegrityViolation {
        entity: &'static str,
        uid: String,
        message: String,
    },

    #[error("conflicting {field} for {game_uid}: kept {kept}, discarded {discarded}")]
    ConflictingAuthoritativeFields {
        game_uid: String,
        field: &'static str,
        kept: String,
        discarded: String,
    },

    #[error("alias {native_id:?} from {source_tag} already maps to {existing}")]
    AliasReassignment {
        source_tag: SourceTag,
        native_id: String,
        existing: String,
    },

    #[error("sync cancelled for {league} {season}")]
    Cancelled { league: String, season: i32 },

    #[error("config: {0}")]
    Config(String),

    #[error("sqlite: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Errors confined to a single record; the batch carries on.
    pub fn is_record_local(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedRecord { .. }
                | SyncError::UnresolvedIdentity { .. }
                | SyncError::IntegrityViolation { .. }
                | SyncError::ConflictingAuthoritativeFields { .. }
        )
    }

    pub fn integrity(entity: &'static str, uid: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::IntegrityViolation {
            entity,
            uid: uid.into(),
            message: message.into(),
        }
    }
}
