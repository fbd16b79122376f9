use crate::net::FetchError;
use crate::repo::RepoError;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// The remote has no record for the requested key (404 or empty search).
    #[error("{key} doesn't exist on the server")] NotFound { key: String },
    #[error("unexpected status {status} from {url}")] UnexpectedStatus { status: u16, url: String },
    #[error("malformed payload from {url}: {reason}")] Malformed { url: String, reason: String },
    #[error(transparent)] Fetch(#[from] FetchError),
    #[error("store: {0}")] Repo(#[from] RepoError),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }
}
