use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Load(#[from] invox_loader::LoadError),

    #[error("unknown run '{0}'")]
    UnknownRun(String),
}
