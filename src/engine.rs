//! 引擎门面
//!
//! 把自动保存调度器、模糊索引、工作区记录和文件监视聚合成一个
//! 由调用方线程驱动的整体。消费方在自己的循环里调用操作方法并
//! 定期 poll，引擎从不回调；所有耗时 IO 都发往内部运行时，
//! poll 只消化已完成任务送回的消息。
//!
//! 工作区切换是仅有的同步屏障：先把所有脏缓冲 flush 落盘，
//! 任何一个失败都原地放弃切换，旧工作区保持活跃。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Instant;

use thiserror::Error;

use crate::autosave::{AutosaveScheduler, FlushOutcome, SaveOutcome};
use crate::config::EngineConfig;
use crate::events::{event_bus, EngineEvent, EventReceiver, EventSender};
use crate::fs::watcher::{FileWatcher, WatchEvent};
use crate::fs::{FileStore, FileStoreStats, FsError};
use crate::index::rebuild::{spawn_rebuild, RebuildLimits, RebuildMessage, RebuildTask};
use crate::index::{FuzzyIndex, SearchQuery, SearchResult};
use crate::runtime::EngineRuntime;
use crate::workspace::favorites::FavoriteFolders;
use crate::workspace::recent::RecentFiles;
use crate::workspace::{WorkspaceError, WorkspaceSnapshot, WorkspaceStore, MAX_WORKSPACES};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to prepare data directory: {0}")]
    DataDir(#[source] io::Error),
    #[error("failed to start engine runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// 切换工作区的失败结局
#[derive(Debug, Error)]
pub enum SwitchError {
    /// 有脏缓冲写不下去，切换被放弃，一切保持原状
    #[error("switch blocked by {}: {error}", path.display())]
    Blocked { path: PathBuf, error: String },
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// 后台读完成的窗格内容
struct LoadedPane {
    path: PathBuf,
    result: Result<String, FsError>,
}

pub struct Engine {
    config: EngineConfig,
    runtime: EngineRuntime,
    store: FileStore,
    scheduler: AutosaveScheduler,
    index: FuzzyIndex,
    workspaces: WorkspaceStore,
    recent: RecentFiles,
    favorites: FavoriteFolders,
    watcher: Option<FileWatcher>,
    events: EventSender,
    load_tx: Sender<LoadedPane>,
    load_rx: Receiver<LoadedPane>,
    rebuild_tx: Sender<RebuildMessage>,
    rebuild_rx: Receiver<RebuildMessage>,
    active_rebuild: Option<RebuildTask>,
    /// 工作区/最近/收藏有未落盘的改动
    meta_dirty: bool,
    meta_changed_at: Instant,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<(Self, EventReceiver), EngineError> {
        config.ensure_data_dir().map_err(EngineError::DataDir)?;
        let runtime = EngineRuntime::new().map_err(EngineError::Runtime)?;
        let store = FileStore::new();
        let scheduler = AutosaveScheduler::new(runtime.handle(), store.clone(), config.clone());
        let index = FuzzyIndex::new(config.index_max_excerpt_lines, config.index_max_excerpt_len);
        let workspaces = WorkspaceStore::load_or_init(config.workspaces_path())?;
        let recent = RecentFiles::load_or_default(&config.recent_path());
        let favorites = FavoriteFolders::load_or_default(&config.favorites_path());
        let watcher = match FileWatcher::new() {
            Ok(watcher) => Some(watcher),
            Err(error) => {
                tracing::warn!(error = %error, "file watcher unavailable, external edits will go unnoticed");
                None
            }
        };
        let (events, receiver) = event_bus();
        let (load_tx, load_rx) = channel();
        let (rebuild_tx, rebuild_rx) = channel();

        let engine = Self {
            config,
            runtime,
            store,
            scheduler,
            index,
            workspaces,
            recent,
            favorites,
            watcher,
            events,
            load_tx,
            load_rx,
            rebuild_tx,
            rebuild_rx,
            active_rebuild: None,
            meta_dirty: false,
            meta_changed_at: Instant::now(),
        };

        // 恢复上次活跃工作区的窗格，内容在后台读取
        let snapshot = engine.workspaces.snapshot(engine.workspaces.active_id())?;
        for file in &snapshot.open_files {
            engine.request_pane_load(&file.path);
        }
        tracing::info!(
            workspace = snapshot.id,
            files = snapshot.open_files.len(),
            "engine started"
        );

        Ok((engine, receiver))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 文件存取的累计计数，用于观测与测试
    pub fn io_stats(&self) -> std::sync::Arc<FileStoreStats> {
        self.store.stats()
    }

    /// 消化后台消息并推进检查点，消费方每帧调用一次
    pub fn poll(&mut self) {
        self.pump_saves();
        self.pump_loads();
        self.pump_rebuild();
        self.pump_watcher();
        self.maybe_checkpoint();
    }

    // ---- 编辑与保存 ----

    /// 缓冲内容变化，重置该文件的防抖窗口
    pub fn on_edit(&mut self, path: &Path, content: String) {
        self.scheduler.register_edit(path, content);
    }

    /// 打开窗格：登记记录并在后台读取内容
    ///
    /// 内容就绪后才会出现在 `open_paths` 里，期间的编辑照常接收。
    pub fn on_pane_open(&mut self, path: &Path) {
        let active = self.workspaces.active_id();
        let already_recorded = self
            .workspaces
            .get(active)
            .map(|s| s.open_files.iter().any(|f| f.path == path))
            .unwrap_or(false);
        if !already_recorded {
            let slot = self
                .workspaces
                .get(active)
                .map(|s| s.open_files.len() as u32)
                .unwrap_or(0);
            if self.workspaces.record_pane_open(active, path, slot) {
                self.mark_meta_dirty();
            }
        }
        if self.recent.touch(path) {
            self.mark_meta_dirty();
        }
        self.checkpoint_now();

        if self.scheduler.is_open(path) {
            return;
        }
        self.request_pane_load(path);
    }

    /// 关闭窗格：先 flush，失败则拒绝关闭并保留缓冲
    pub fn on_pane_close(&mut self, path: &Path) -> bool {
        match self.scheduler.close_file(path) {
            FlushOutcome::Saved(content) => self.note_saved(path, &content),
            FlushOutcome::Failed { error, attempts } => {
                self.events.emit(EngineEvent::SaveFailed {
                    path: path.to_path_buf(),
                    error,
                    attempts,
                });
                return false;
            }
            FlushOutcome::Clean => {}
        }

        let active = self.workspaces.active_id();
        if self.workspaces.record_pane_close(active, path) {
            self.mark_meta_dirty();
        }
        self.checkpoint_now();
        self.sync_watcher();
        true
    }

    /// 放弃未保存内容并关闭窗格
    pub fn discard_pane(&mut self, path: &Path) {
        self.scheduler.cancel(path);
        let active = self.workspaces.active_id();
        if self.workspaces.record_pane_close(active, path) {
            self.mark_meta_dirty();
        }
        self.checkpoint_now();
        self.sync_watcher();
    }

    pub fn move_pane(&mut self, path: &Path, pane_slot: u32) {
        let active = self.workspaces.active_id();
        if self.workspaces.record_pane_open(active, path, pane_slot) {
            self.mark_meta_dirty();
        }
    }

    pub fn update_cursor(&mut self, path: &Path, cursor: u64) {
        let active = self.workspaces.active_id();
        if self.workspaces.update_cursor(active, path, cursor) {
            self.mark_meta_dirty();
        }
    }

    pub fn set_folder_expanded(&mut self, path: &Path, expanded: bool) {
        let active = self.workspaces.active_id();
        if self.workspaces.set_folder_expanded(active, path, expanded) {
            self.mark_meta_dirty();
        }
    }

    /// 立即写盘单个文件，返回是否已持久
    pub fn flush_file(&mut self, path: &Path) -> bool {
        match self.scheduler.flush(path) {
            FlushOutcome::Clean => true,
            FlushOutcome::Saved(content) => {
                self.note_saved(path, &content);
                true
            }
            FlushOutcome::Failed { error, attempts } => {
                self.events.emit(EngineEvent::SaveFailed {
                    path: path.to_path_buf(),
                    error,
                    attempts,
                });
                false
            }
        }
    }

    /// 写盘所有脏文件，全部成功才返回 true
    pub fn flush_all_files(&mut self) -> bool {
        let mut all_clean = true;
        for (path, outcome) in self.scheduler.flush_all() {
            match outcome {
                FlushOutcome::Clean => {}
                FlushOutcome::Saved(content) => self.note_saved(&path, &content),
                FlushOutcome::Failed { error, attempts } => {
                    all_clean = false;
                    self.events.emit(EngineEvent::SaveFailed { path, error, attempts });
                }
            }
        }
        all_clean
    }

    pub fn has_unsaved(&self) -> bool {
        self.scheduler.has_dirty()
    }

    pub fn is_dirty(&self, path: &Path) -> bool {
        self.scheduler.is_dirty(path)
    }

    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.scheduler.open_paths()
    }

    pub fn buffer_of(&self, path: &Path) -> Option<&str> {
        self.scheduler.buffer_of(path)
    }

    // ---- 工作区 ----

    pub fn active_workspace(&self) -> u8 {
        self.workspaces.active_id()
    }

    pub fn list_workspaces(&self) -> Vec<u8> {
        self.workspaces.list()
    }

    pub fn workspace_snapshot(&self, id: u8) -> Result<WorkspaceSnapshot, WorkspaceError> {
        self.workspaces.snapshot(id)
    }

    pub fn save_workspace(&mut self, snapshot: WorkspaceSnapshot) -> Result<(), WorkspaceError> {
        self.workspaces.upsert(snapshot)?;
        self.mark_meta_dirty();
        self.checkpoint_now();
        Ok(())
    }

    pub fn delete_workspace(&mut self, id: u8) -> Result<bool, WorkspaceError> {
        let removed = self.workspaces.delete(id)?;
        if removed {
            self.mark_meta_dirty();
            self.checkpoint_now();
        }
        Ok(removed)
    }

    pub fn rename_workspace(
        &mut self,
        id: u8,
        name: impl Into<String>,
    ) -> Result<(), WorkspaceError> {
        self.workspaces.rename(id, name)?;
        self.mark_meta_dirty();
        self.checkpoint_now();
        Ok(())
    }

    /// 切换活跃工作区
    ///
    /// 流程：flush 屏障 → 持久化新的活跃指针 → 丢弃旧句柄 →
    /// 后台加载目标工作区的窗格。任何脏缓冲写不下去都在第一步
    /// 放弃，不触碰任何状态。
    pub fn switch_workspace(&mut self, id: u8) -> Result<WorkspaceSnapshot, SwitchError> {
        if !(1..=MAX_WORKSPACES).contains(&id) {
            return Err(SwitchError::Workspace(WorkspaceError::InvalidId(id)));
        }
        let previous = self.workspaces.active_id();
        if id == previous {
            return Ok(self.workspaces.snapshot(id)?);
        }

        let mut blocker: Option<(PathBuf, String)> = None;
        for (path, outcome) in self.scheduler.flush_all() {
            match outcome {
                FlushOutcome::Clean => {}
                FlushOutcome::Saved(content) => self.note_saved(&path, &content),
                FlushOutcome::Failed { error, attempts } => {
                    self.events.emit(EngineEvent::SaveFailed {
                        path: path.clone(),
                        error: error.clone(),
                        attempts,
                    });
                    if blocker.is_none() {
                        blocker = Some((path, error));
                    }
                }
            }
        }
        if let Some((path, error)) = blocker {
            let name = self
                .workspaces
                .get(id)
                .map(|s| s.display_name())
                .unwrap_or_else(|| format!("Workspace {id}"));
            tracing::warn!(
                workspace = id,
                path = %path.display(),
                error = %error,
                "workspace switch blocked by unsaved file"
            );
            self.events.emit(EngineEvent::WorkspaceSwitchBlocked {
                name,
                path: path.clone(),
                error: error.clone(),
            });
            return Err(SwitchError::Blocked { path, error });
        }

        // 屏障通过后才允许创建目标工作区，被挡下的切换不留痕迹
        self.workspaces.ensure(id)?;
        self.workspaces.touch(previous);
        self.workspaces.set_active(id)?;
        if let Err(error) = self.persist_meta() {
            let _ = self.workspaces.set_active(previous);
            tracing::error!(error = %error, "failed to persist workspace switch");
            return Err(SwitchError::Workspace(error));
        }
        self.meta_dirty = false;

        // 屏障之后所有旧句柄都是干净的，直接丢弃
        for path in self.scheduler.open_paths() {
            self.scheduler.cancel(&path);
        }

        let snapshot = self.workspaces.snapshot(id)?;
        for file in &snapshot.open_files {
            self.request_pane_load(&file.path);
        }
        self.sync_watcher();
        tracing::info!(
            from = previous,
            to = id,
            files = snapshot.open_files.len(),
            "workspace activated"
        );
        Ok(snapshot)
    }

    // ---- 搜索与索引 ----

    /// 非阻塞查询当前索引
    pub fn search(&self, text: &str) -> Vec<SearchResult> {
        self.index.search(&SearchQuery::new(text))
    }

    pub fn search_with(&self, query: &SearchQuery) -> Vec<SearchResult> {
        self.index.search(query)
    }

    /// 启动全量重建，自动作废进行中的那一次，返回任务 id
    pub fn start_index_rebuild(&mut self, roots: Vec<PathBuf>) -> u64 {
        if let Some(task) = self.active_rebuild.take() {
            task.cancel();
            tracing::debug!(rebuild_id = task.id(), "superseding active rebuild");
        }
        let limits = RebuildLimits {
            max_file_size: self.config.index_max_file_size,
            max_excerpt_lines: self.config.index_max_excerpt_lines,
            max_excerpt_len: self.config.index_max_excerpt_len,
        };
        let task = spawn_rebuild(
            self.runtime.handle(),
            roots,
            limits,
            self.rebuild_tx.clone(),
        );
        let id = task.id();
        self.active_rebuild = Some(task);
        id
    }

    /// 请求取消，确认消息到达 poll 后才算落定
    pub fn cancel_index_rebuild(&mut self) {
        if let Some(task) = &self.active_rebuild {
            task.cancel();
        }
    }

    pub fn rebuild_in_progress(&self) -> bool {
        self.active_rebuild.is_some()
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    // ---- 文件操作 ----

    /// 改名：先 flush 旧路径，再移动磁盘文件和内存状态
    pub fn rename_file(&mut self, from: &Path, to: &Path) -> Result<(), FsError> {
        if self.scheduler.is_open(from) {
            match self.scheduler.flush(from) {
                FlushOutcome::Saved(content) => self.note_saved(from, &content),
                FlushOutcome::Failed { error, .. } => {
                    return Err(FsError::Io(io::Error::new(io::ErrorKind::Other, error)));
                }
                FlushOutcome::Clean => {}
            }
        }
        // 先消化链上写入的回执，改名后它们会指向错误的路径
        self.pump_saves();

        let store = self.store.clone();
        let (from_owned, to_owned) = (from.to_path_buf(), to.to_path_buf());
        self.runtime
            .block_on(async move { store.rename(&from_owned, &to_owned).await })?;

        self.scheduler.rename(from, to);
        if !self.index.rename_file(from, to) {
            // 之前没进索引的文件顺带补录，磁盘内容即权威内容
            let store = self.store.clone();
            let limit = self.config.index_max_file_size;
            let target = to.to_path_buf();
            if let Ok(content) = self
                .runtime
                .block_on(async move { store.read_for_index(&target, limit).await })
            {
                self.index.update_file(to, &content);
            }
        }

        let active = self.workspaces.active_id();
        if self.workspaces.rename_path(active, from, to) {
            self.mark_meta_dirty();
            // 改名撞上在途加载时旧路径的回执会被丢弃，这里补一次新路径的
            if !self.scheduler.is_open(to) {
                self.request_pane_load(to);
            }
        }
        if self.recent.remove(from) {
            self.recent.touch(to);
            self.mark_meta_dirty();
        }
        self.checkpoint_now();
        self.sync_watcher();
        tracing::info!(from = %from.display(), to = %to.display(), "file renamed");
        Ok(())
    }

    /// 删除文件，打开的句柄与索引条目一并清理
    pub fn delete_file(&mut self, path: &Path) -> Result<(), FsError> {
        if self.scheduler.is_open(path) {
            // flush 排空在途写链，删除之后不能再有写落地
            match self.scheduler.flush(path) {
                FlushOutcome::Saved(content) => self.note_saved(path, &content),
                // 马上要删除的文件，最后一笔写不下去无伤大雅
                FlushOutcome::Failed { .. } | FlushOutcome::Clean => {}
            }
        }
        self.pump_saves();
        self.scheduler.cancel(path);
        self.sync_watcher();

        let store = self.store.clone();
        let target = path.to_path_buf();
        self.runtime
            .block_on(async move { store.remove(&target).await })?;

        self.index.remove_file(path);
        let active = self.workspaces.active_id();
        if self.workspaces.record_pane_close(active, path) {
            self.mark_meta_dirty();
        }
        if self.recent.remove(path) {
            self.mark_meta_dirty();
        }
        self.checkpoint_now();
        tracing::info!(path = %path.display(), "file deleted");
        Ok(())
    }

    // ---- 最近与收藏 ----

    pub fn recent_files(&self) -> &[PathBuf] {
        self.recent.as_slice()
    }

    pub fn favorite_folders(&self) -> &[PathBuf] {
        self.favorites.as_slice()
    }

    pub fn add_favorite(&mut self, path: &Path) -> bool {
        let added = self.favorites.add(path);
        if added {
            self.mark_meta_dirty();
        }
        added
    }

    pub fn remove_favorite(&mut self, path: &Path) -> bool {
        let removed = self.favorites.remove(path);
        if removed {
            self.mark_meta_dirty();
        }
        removed
    }

    // ---- 内部泵 ----

    fn pump_saves(&mut self) {
        for outcome in self.scheduler.pump() {
            match outcome {
                SaveOutcome::Saved { path, content } => self.note_saved(&path, &content),
                SaveOutcome::Failed {
                    path,
                    error,
                    attempts,
                } => {
                    self.events.emit(EngineEvent::SaveFailed {
                        path,
                        error,
                        attempts,
                    });
                }
            }
        }
    }

    /// 落盘成功的统一善后：索引、监视器回执、事件
    fn note_saved(&mut self, path: &Path, content: &str) {
        self.index.update_file(path, content);
        if let Some(watcher) = &mut self.watcher {
            watcher.acknowledge_write(path);
        }
        self.events.emit(EngineEvent::SaveSucceeded {
            path: path.to_path_buf(),
        });
    }

    fn pump_loads(&mut self) {
        let mut synced = false;
        while let Ok(loaded) = self.load_rx.try_recv() {
            // 读取期间窗格可能已关闭、改名或随切换换出，过期回执直接丢弃
            let active = self.workspaces.active_id();
            let still_open = self
                .workspaces
                .get(active)
                .map(|s| s.open_files.iter().any(|f| f.path == loaded.path))
                .unwrap_or(false);
            if !still_open {
                tracing::debug!(path = %loaded.path.display(), "dropping load for a pane no longer open");
                continue;
            }
            let content = match loaded.result {
                Ok(content) => content,
                Err(FsError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %loaded.path.display(), "pane opened for a new file");
                    String::new()
                }
                Err(error) => {
                    // 读不出来就不开句柄，避免空缓冲覆盖原文件
                    tracing::warn!(path = %loaded.path.display(), error = %error, "pane load failed");
                    let active = self.workspaces.active_id();
                    if self.workspaces.record_pane_close(active, &loaded.path) {
                        self.mark_meta_dirty();
                    }
                    continue;
                }
            };
            self.index.update_file(&loaded.path, &content);
            self.scheduler.open_file(&loaded.path, content);
            synced = true;
        }
        if synced {
            self.sync_watcher();
        }
    }

    fn pump_rebuild(&mut self) {
        while let Ok(message) = self.rebuild_rx.try_recv() {
            match message {
                RebuildMessage::Progress { rebuild_id, percent } => {
                    if self.active_rebuild.as_ref().map(|t| t.id()) != Some(rebuild_id) {
                        continue;
                    }
                    self.events
                        .emit(EngineEvent::IndexRebuildProgress { percent });
                }
                RebuildMessage::Built {
                    rebuild_id,
                    entries,
                    indexed,
                    skipped,
                } => {
                    if self.active_rebuild.as_ref().map(|t| t.id()) != Some(rebuild_id) {
                        tracing::debug!(rebuild_id, "dropping result of superseded rebuild");
                        continue;
                    }
                    self.active_rebuild = None;
                    self.index.replace_all(entries);
                    self.reindex_open_buffers();
                    tracing::info!(indexed, skipped, "index rebuild finished");
                    self.events
                        .emit(EngineEvent::IndexRebuildFinished { indexed, skipped });
                }
                RebuildMessage::Cancelled { rebuild_id } => {
                    if self.active_rebuild.as_ref().map(|t| t.id()) == Some(rebuild_id) {
                        self.active_rebuild = None;
                        self.events.emit(EngineEvent::IndexRebuildCancelled);
                    } else {
                        tracing::debug!(rebuild_id, "superseded rebuild wound down");
                    }
                }
            }
        }
    }

    /// 整体换入新索引后补登打开文件：扫描根之外的打开文件
    /// 不在新条目集里，直接消失会让用户的搜索结果凭空变少
    fn reindex_open_buffers(&mut self) {
        for path in self.scheduler.open_paths() {
            if self.index.contains(&path) {
                continue;
            }
            if let Some(buffer) = self.scheduler.buffer_of(&path) {
                self.index.update_file(&path, buffer);
                if self.scheduler.is_dirty(&path) {
                    self.index.mark_stale(&path);
                }
            }
        }
    }

    fn pump_watcher(&mut self) {
        let Some(watcher) = &mut self.watcher else {
            return;
        };
        for event in watcher.drain() {
            match event {
                WatchEvent::Changed(path) | WatchEvent::Removed(path) => {
                    self.index.mark_stale(&path);
                    self.events.emit(EngineEvent::FileChangedOnDisk { path });
                }
            }
        }
    }

    fn maybe_checkpoint(&mut self) {
        if !self.meta_dirty {
            return;
        }
        if self.meta_changed_at.elapsed() < self.config.checkpoint_idle {
            return;
        }
        self.checkpoint_now();
    }

    fn checkpoint_now(&mut self) {
        if !self.meta_dirty {
            return;
        }
        match self.persist_meta() {
            Ok(()) => self.meta_dirty = false,
            Err(error) => {
                tracing::warn!(error = %error, "metadata checkpoint failed, keeping dirty flag");
            }
        }
    }

    fn persist_meta(&self) -> Result<(), WorkspaceError> {
        let handle = self.runtime.handle();
        self.workspaces.persist(&handle, &self.store)?;
        self.recent
            .persist(&handle, &self.store, &self.config.recent_path())?;
        self.favorites
            .persist(&handle, &self.store, &self.config.favorites_path())?;
        Ok(())
    }

    fn mark_meta_dirty(&mut self) {
        self.meta_dirty = true;
        self.meta_changed_at = Instant::now();
    }

    fn request_pane_load(&self, path: &Path) {
        let store = self.store.clone();
        let tx = self.load_tx.clone();
        let task_path = path.to_path_buf();
        self.runtime.spawn(async move {
            let result = store.read_to_string(&task_path).await;
            let _ = tx.send(LoadedPane {
                path: task_path,
                result,
            });
        });
    }

    fn sync_watcher(&mut self) {
        let Some(watcher) = &mut self.watcher else {
            return;
        };
        let paths = self.scheduler.open_paths();
        watcher.sync_open_files(paths.iter().map(|p| p.as_path()));
    }
}
