//! 收藏目录：供侧边栏快速跳转，只接受存在的目录。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::fs::{FileStore, FsError};
use crate::workspace::WorkspaceError;

pub const MAX_FAVORITE_FOLDERS: usize = 15;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FavoriteFolders {
    #[serde(default)]
    entries: Vec<PathBuf>,
}

impl FavoriteFolders {
    pub fn load_or_default(path: &Path) -> Self {
        let mut list: Self = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|error| {
                tracing::warn!(path = %path.display(), error = %error, "discarding malformed favorites");
                Self::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Self::default(),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to read favorites");
                Self::default()
            }
        };
        // 目录可能在两次启动之间被移走
        list.entries.retain(|p| p.is_dir());
        list
    }

    /// 非目录、重复或超出上限时拒绝
    pub fn add(&mut self, path: &Path) -> bool {
        if self.entries.len() >= MAX_FAVORITE_FOLDERS {
            tracing::debug!(path = %path.display(), "favorites list is full");
            return false;
        }
        if self.entries.iter().any(|p| p == path) {
            return false;
        }
        if !path.is_dir() {
            tracing::debug!(path = %path.display(), "refusing non-directory favorite");
            return false;
        }
        self.entries.push(path.to_path_buf());
        true
    }

    pub fn remove(&mut self, path: &Path) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p| p != path);
        self.entries.len() != before
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|p| p == path)
    }

    pub fn as_slice(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn persist(
        &self,
        runtime: &Handle,
        store: &FileStore,
        path: &Path,
    ) -> Result<(), WorkspaceError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(FsError::from)?;
            }
        }
        let store = store.clone();
        let path = path.to_path_buf();
        runtime.block_on(async move { store.write_atomic(&path, &json).await })?;
        Ok(())
    }
}
