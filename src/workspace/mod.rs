//! 工作区持久化
//!
//! 最多 4 个命名工作区，记录打开文件（含光标与窗格槽位）、
//! 展开的目录与最后活跃时间。全部记录连同当前活跃工作区 id
//! 存放在数据目录下的单个 JSON 文件里，原子写入。
//!
//! 格式向前兼容：未知字段忽略，缺失字段取默认值。谁是活跃
//! 工作区、何时允许切换由引擎裁决，这里只管记录与落盘。

pub mod favorites;
pub mod recent;

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;

use crate::fs::{FileStore, FsError};

/// 工作区数量上限，id 取值 1..=4
pub const MAX_WORKSPACES: u8 = 4;

const WORKSPACE_FORMAT_VERSION: u32 = 1;

pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace id out of range: {0}")]
    InvalidId(u8),
    #[error("cannot delete the active workspace")]
    DeleteActive,
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("invalid workspace payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// 快照里的单个打开文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenFileState {
    pub path: PathBuf,
    /// 光标的字节偏移
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub pane_slot: u32,
}

/// 单个工作区的持久快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub id: u8,
    /// 用户可改名，空串表示沿用默认名
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub open_files: Vec<OpenFileState>,
    /// 已排序的展开目录集合
    #[serde(default)]
    pub expanded_folders: Vec<PathBuf>,
    #[serde(default)]
    pub last_active_unix: i64,
}

impl WorkspaceSnapshot {
    pub fn empty(id: u8) -> Self {
        Self {
            id,
            name: String::new(),
            open_files: Vec::new(),
            expanded_folders: Vec::new(),
            last_active_unix: current_timestamp(),
        }
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("Workspace {}", self.id)
        } else {
            self.name.clone()
        }
    }

    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.open_files.iter().map(|f| f.path.clone()).collect()
    }
}

/// 落盘文件的根结构
#[derive(Debug, Serialize, Deserialize)]
struct WorkspaceFile {
    format_version: u32,
    #[serde(default = "default_active_id")]
    active_id: u8,
    #[serde(default)]
    workspaces: Vec<WorkspaceSnapshot>,
}

fn default_active_id() -> u8 {
    1
}

/// 工作区记录的内存载体与持久化入口
pub struct WorkspaceStore {
    path: PathBuf,
    active_id: u8,
    workspaces: BTreeMap<u8, WorkspaceSnapshot>,
}

impl WorkspaceStore {
    /// 从磁盘加载；文件缺失时初始化为只有 1 号的默认状态
    pub fn load_or_init(path: PathBuf) -> Result<Self, WorkspaceError> {
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => Some(serde_json::from_str::<WorkspaceFile>(&contents)?),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(WorkspaceError::Fs(err.into())),
        };

        let mut workspaces = BTreeMap::new();
        let mut active_id = default_active_id();
        if let Some(file) = file {
            active_id = file.active_id;
            for snapshot in file.workspaces {
                if !(1..=MAX_WORKSPACES).contains(&snapshot.id) {
                    tracing::warn!(id = snapshot.id, "dropping workspace with invalid id");
                    continue;
                }
                workspaces.insert(snapshot.id, snapshot);
            }
        }

        if workspaces.is_empty() {
            workspaces.insert(1, WorkspaceSnapshot::empty(1));
        }
        if !workspaces.contains_key(&active_id) {
            // 活跃 id 指向不存在的工作区时回退到最小的现存 id
            active_id = *workspaces.keys().next().unwrap_or(&1);
        }

        Ok(Self {
            path,
            active_id,
            workspaces,
        })
    }

    pub fn active_id(&self) -> u8 {
        self.active_id
    }

    pub fn list(&self) -> Vec<u8> {
        self.workspaces.keys().copied().collect()
    }

    pub fn get(&self, id: u8) -> Option<&WorkspaceSnapshot> {
        self.workspaces.get(&id)
    }

    /// 取快照副本，id 不存在或越界报错
    pub fn snapshot(&self, id: u8) -> Result<WorkspaceSnapshot, WorkspaceError> {
        self.workspaces
            .get(&id)
            .cloned()
            .ok_or(WorkspaceError::InvalidId(id))
    }

    /// 整体替换一个工作区的记录
    pub fn upsert(&mut self, snapshot: WorkspaceSnapshot) -> Result<(), WorkspaceError> {
        if !(1..=MAX_WORKSPACES).contains(&snapshot.id) {
            return Err(WorkspaceError::InvalidId(snapshot.id));
        }
        self.workspaces.insert(snapshot.id, snapshot);
        Ok(())
    }

    /// 确保 id 存在，必要时创建空工作区
    pub fn ensure(&mut self, id: u8) -> Result<&mut WorkspaceSnapshot, WorkspaceError> {
        if !(1..=MAX_WORKSPACES).contains(&id) {
            return Err(WorkspaceError::InvalidId(id));
        }
        Ok(self
            .workspaces
            .entry(id)
            .or_insert_with(|| WorkspaceSnapshot::empty(id)))
    }

    /// 标记活跃工作区并刷新其时间戳
    pub fn set_active(&mut self, id: u8) -> Result<(), WorkspaceError> {
        if !self.workspaces.contains_key(&id) {
            return Err(WorkspaceError::InvalidId(id));
        }
        self.active_id = id;
        if let Some(snapshot) = self.workspaces.get_mut(&id) {
            snapshot.last_active_unix = current_timestamp();
        }
        Ok(())
    }

    /// 删除工作区，活跃工作区拒绝删除
    pub fn delete(&mut self, id: u8) -> Result<bool, WorkspaceError> {
        if id == self.active_id {
            return Err(WorkspaceError::DeleteActive);
        }
        Ok(self.workspaces.remove(&id).is_some())
    }

    /// 登记打开的窗格，已存在的路径只更新槽位
    pub fn record_pane_open(&mut self, id: u8, path: &Path, pane_slot: u32) -> bool {
        let Some(snapshot) = self.workspaces.get_mut(&id) else {
            return false;
        };
        if let Some(existing) = snapshot.open_files.iter_mut().find(|f| f.path == path) {
            if existing.pane_slot == pane_slot {
                return false;
            }
            existing.pane_slot = pane_slot;
            return true;
        }
        snapshot.open_files.push(OpenFileState {
            path: path.to_path_buf(),
            cursor: 0,
            pane_slot,
        });
        true
    }

    pub fn record_pane_close(&mut self, id: u8, path: &Path) -> bool {
        let Some(snapshot) = self.workspaces.get_mut(&id) else {
            return false;
        };
        let before = snapshot.open_files.len();
        snapshot.open_files.retain(|f| f.path != path);
        snapshot.open_files.len() != before
    }

    pub fn update_cursor(&mut self, id: u8, path: &Path, cursor: u64) -> bool {
        let Some(snapshot) = self.workspaces.get_mut(&id) else {
            return false;
        };
        match snapshot.open_files.iter_mut().find(|f| f.path == path) {
            Some(file) if file.cursor != cursor => {
                file.cursor = cursor;
                true
            }
            _ => false,
        }
    }

    pub fn set_folder_expanded(&mut self, id: u8, path: &Path, expanded: bool) -> bool {
        let Some(snapshot) = self.workspaces.get_mut(&id) else {
            return false;
        };
        if expanded {
            match snapshot.expanded_folders.binary_search_by(|p| p.as_path().cmp(path)) {
                Ok(_) => false,
                Err(pos) => {
                    snapshot.expanded_folders.insert(pos, path.to_path_buf());
                    true
                }
            }
        } else {
            match snapshot.expanded_folders.binary_search_by(|p| p.as_path().cmp(path)) {
                Ok(pos) => {
                    snapshot.expanded_folders.remove(pos);
                    true
                }
                Err(_) => false,
            }
        }
    }

    pub fn rename(&mut self, id: u8, name: impl Into<String>) -> Result<(), WorkspaceError> {
        let snapshot = self
            .workspaces
            .get_mut(&id)
            .ok_or(WorkspaceError::InvalidId(id))?;
        snapshot.name = name.into();
        Ok(())
    }

    /// 文件改名后同步所有引用它的打开记录
    pub fn rename_path(&mut self, id: u8, from: &Path, to: &Path) -> bool {
        let Some(snapshot) = self.workspaces.get_mut(&id) else {
            return false;
        };
        let mut changed = false;
        for file in &mut snapshot.open_files {
            if file.path == from {
                file.path = to.to_path_buf();
                changed = true;
            }
        }
        changed
    }

    pub fn touch(&mut self, id: u8) {
        if let Some(snapshot) = self.workspaces.get_mut(&id) {
            snapshot.last_active_unix = current_timestamp();
        }
    }

    /// 原子写回磁盘
    pub fn persist(&self, runtime: &Handle, store: &FileStore) -> Result<(), WorkspaceError> {
        let file = WorkspaceFile {
            format_version: WORKSPACE_FORMAT_VERSION,
            active_id: self.active_id,
            workspaces: self.workspaces.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(FsError::from)?;
            }
        }

        let store = store.clone();
        let path = self.path.clone();
        runtime.block_on(async move { store.write_atomic(&path, &json).await })?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/workspace.rs"]
mod tests;
