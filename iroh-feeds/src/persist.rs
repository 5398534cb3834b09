//! Persistence of the joined topics and user settings.
//!
//! Only topic identity is persisted. Records are always rehydrated from the persistence and
//! network sources when topics are loaded.

use std::path::{Path, PathBuf};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::key::{NotificationKey, TopicId};

/// Display name used until the user picks one.
pub const DEFAULT_DISPLAY_NAME: &str = "anonymous";

/// A persisted topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTopic {
    /// The topic id.
    pub id: TopicId,
    /// The name the topic was joined with.
    pub display_name: String,
    /// The notification key, stored as hex.
    #[serde(rename = "notificationKeyHex")]
    pub key: NotificationKey,
}

/// Everything persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    /// The local user's display name.
    pub display_name: String,
    /// Joined topics, in join order.
    pub topics: Vec<PersistedTopic>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            topics: Vec::new(),
        }
    }
}

/// A JSON file holding the [`PersistedState`].
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// Creates a state file handle. Nothing is read or written yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state. A missing file yields the default state.
    pub async fn load(&self) -> Result<PersistedState, PersistError> {
        if !tokio::fs::try_exists(&self.path).await.context(IoSnafu)? {
            debug!(path = %self.path.display(), "no state file");
            return Ok(PersistedState::default());
        }
        let data = tokio::fs::read(&self.path).await.context(IoSnafu)?;
        let state = serde_json::from_slice(&data).context(DecodeSnafu)?;
        Ok(state)
    }

    /// Reads the state, falling back to the default state on any error.
    pub async fn load_or_default(&self) -> PersistedState {
        match self.load().await {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %self.path.display(), "failed to load state, using defaults: {err:#}");
                PersistedState::default()
            }
        }
    }

    /// Writes the state.
    ///
    /// The state is written to a temporary file first and then moved into place, so a
    /// crash never leaves a truncated file behind.
    pub async fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let data = serde_json::to_vec_pretty(state).context(EncodeSnafu)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.context(IoSnafu)?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await.context(IoSnafu)?;
        tokio::fs::rename(&tmp, &self.path).await.context(IoSnafu)?;
        Ok(())
    }
}

/// Failed to read or write the [`StateFile`].
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum PersistError {
    #[snafu(display("state file io failed"))]
    Io { source: std::io::Error },
    #[snafu(display("failed to encode state"))]
    Encode { source: serde_json::Error },
    #[snafu(display("failed to decode state"))]
    Decode { source: serde_json::Error },
}
