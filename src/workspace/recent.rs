//! 最近打开文件列表：按最近使用排序，定长去重。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::fs::{FileStore, FsError};
use crate::workspace::WorkspaceError;

pub const MAX_RECENT_FILES: usize = 10;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RecentFiles {
    #[serde(default)]
    entries: Vec<PathBuf>,
}

impl RecentFiles {
    /// 读取失败按空列表处理，坏数据不阻塞启动
    pub fn load_or_default(path: &Path) -> Self {
        let mut list: Self = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|error| {
                tracing::warn!(path = %path.display(), error = %error, "discarding malformed recent list");
                Self::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Self::default(),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to read recent list");
                Self::default()
            }
        };
        // 两次启动之间文件可能已被外部删除
        list.entries.retain(|p| p.exists());
        list
    }

    /// 把路径提到最前，超出上限的从尾部淘汰
    pub fn touch(&mut self, path: &Path) -> bool {
        if self.entries.first().map(|p| p.as_path()) == Some(path) {
            return false;
        }
        self.entries.retain(|p| p != path);
        self.entries.insert(0, path.to_path_buf());
        self.entries.truncate(MAX_RECENT_FILES);
        true
    }

    pub fn remove(&mut self, path: &Path) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p| p != path);
        self.entries.len() != before
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
