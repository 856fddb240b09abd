use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] tidalcal_storage::StorageError),
    #[error("caldav error: {0}")]
    CalDav(#[from] tidalcal_core::CalDavError),
    #[error("core error: {0}")]
    Core(#[from] tidalcal_core::CoreError),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("parse error: {0}")]
    Parse(String),
}
