use crate::types::{NewUser, User};
use std::path::PathBuf;

/// Errors from the user store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing document is not a JSON array of user records.
    #[error("Malformed user store at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// User store backed by a single JSON document holding an array of users
///
/// The document is read fresh and rewritten whole on every mutation. A
/// concurrent `append` based on a stale read will overwrite this one's
/// effect; callers accept that lost-update race.
pub struct JsonUserStore {
    path: PathBuf,
}

impl JsonUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to the backing document
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load and decode the full user collection
    ///
    /// A missing file reads as an empty collection; a document that does
    /// not decode as `Vec<User>` fails with [`StoreError::Malformed`].
    pub async fn read_all(&self) -> Result<Vec<User>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        serde_json::from_str(&raw).map_err(|source| StoreError::Malformed {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Append a user and return its assigned id
    ///
    /// Ids are `current count + 1`; not unique under concurrent appends.
    pub async fn append(&self, new_user: NewUser) -> Result<u64, StoreError> {
        let mut users = self.read_all().await?;
        let id = users.len() as u64 + 1;
        users.push(new_user.with_id(id));

        let json = serde_json::to_string_pretty(&users)
            .expect("user records always serialize");
        tokio::fs::write(&self.path, json).await?;

        tracing::debug!("Appended user {} to {}", id, self.path.display());
        Ok(id)
    }
}
