use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The ledger append did not go through; the grant did not happen.
    #[error("ledger append failed for user {user_id}: {source}")]
    Durability {
        user_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("xp amount must not be negative (got {0})")]
    InvalidAmount(i64),

    #[error("progression profile for user {user_id} is unavailable: {source}")]
    ProfileUnavailable {
        user_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("catalog read failed: {0}")]
    Catalog(#[source] anyhow::Error),

    #[error("focus session {0} not found")]
    SessionNotFound(Uuid),

    #[error("unknown focus technique {0}")]
    UnknownTechnique(String),

    #[error("unknown mission {0}")]
    UnknownMission(String),

    #[error("no active instance of mission {0}")]
    MissionNotActive(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
