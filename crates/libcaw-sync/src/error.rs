use libcaw_core::CawError;
use libcaw_ipc::IpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Core(#[from] CawError),

    #[error("No active file")]
    NoActiveFile,

    #[error("Unexpected response to {action}: {message}")]
    BadResponse { action: String, message: String },
}

impl SyncError {
    pub fn bad_response(action: &str, err: impl std::fmt::Display) -> Self {
        SyncError::BadResponse {
            action: action.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<SyncError> for CawError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Core(e) => e,
            SyncError::Ipc(e) => e.into(),
            SyncError::NoActiveFile => CawError::InvalidArgs("no active file".to_string()),
            e @ SyncError::BadResponse { .. } => CawError::Internal(e.to_string()),
        }
    }
}
