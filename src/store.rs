use crate::protocol::ChatMessage;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt chat history in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Chat histories on local disk, one JSON file per report.
#[derive(Debug, Clone)]
pub struct ChatStore {
    dir: PathBuf,
}

impl ChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            return PathBuf::from(home).join(".rca-chat").join("history");
        }

        PathBuf::from(".rca-chat-history")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads the conversation for `report_id`; an unknown report is empty.
    pub fn load(&self, report_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let path = self.path_for(report_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt { path, source })
    }

    pub fn save(&self, report_id: &str, messages: &[ChatMessage]) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(report_id);
        let content = serde_json::to_string_pretty(messages).map_err(|source| {
            StoreError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;
        std::fs::write(&path, content).map_err(|source| StoreError::Io { path, source })
    }

    pub fn clear(&self, report_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(report_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn path_for(&self, report_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(report_id)))
    }
}

// Report ids come from URLs; keep them from escaping the history directory.
fn file_stem(report_id: &str) -> String {
    let stem: String = report_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}
