//! 自动保存调度
//!
//! 每个打开的文件对应一个 FileHandle，缓冲区的所有修改都经过
//! `register_edit` 进入，同一路径的并发编辑天然串行。
//!
//! 防抖逻辑靠世代计数器：每次编辑递增世代并重新武装定时器，
//! 定时器带着武装时的世代回报，世代已前进的触发一律作废。
//! 一个安静窗口内的连续编辑最终只产生一次落盘。
//!
//! 写失败分两类处理：瞬态错误在内部按指数退避重试，重试耗尽
//! 或遇到永久错误才上报调用方，脏标记保持不变，编辑永不丢失。

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::fs::{self, ErrorClass, FileStore, FsError};

/// 调度器内部消息，由后台任务送回、pump 统一处理
enum SchedulerMessage {
    /// 防抖或退避定时器到期
    TimerFired { path: PathBuf, generation: u64 },
    /// 一次后台写完成
    WriteFinished {
        path: PathBuf,
        generation: u64,
        content: Arc<str>,
        result: Result<(), FsError>,
    },
}

/// pump 产出的保存结局
#[derive(Debug)]
pub enum SaveOutcome {
    /// 内容已落盘
    Saved { path: PathBuf, content: Arc<str> },
    /// 重试耗尽或永久错误，脏标记保持
    Failed {
        path: PathBuf,
        error: String,
        attempts: u32,
    },
}

/// 同步 flush 的结局
#[derive(Debug)]
pub enum FlushOutcome {
    /// 没有待写内容
    Clean,
    /// 本次调用写入了该内容
    Saved(Arc<str>),
    Failed { error: String, attempts: u32 },
}

impl FlushOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, FlushOutcome::Failed { .. })
    }
}

/// 单个打开文件的状态
struct FileHandle {
    buffer: String,
    dirty: bool,
    /// 每次编辑与每次 flush 递增，旧世代的定时器触发作废
    generation: u64,
    /// 当前脏周期内的写尝试次数，编辑与成功都会清零
    attempts: u32,
    /// 最后一次确认落盘内容的指纹，None 表示磁盘状态未知
    last_flushed: Option<u64>,
    /// 最近一次已应用写回执的世代，更旧的回执一律作废
    applied_write_gen: u64,
    last_edit: Option<Instant>,
    /// 上一次后台写的句柄，新写入先等它完成，保证同路径写有序
    write_chain: Option<JoinHandle<()>>,
}

impl FileHandle {
    fn new(content: String) -> Self {
        let fingerprint = fs::fingerprint(&content);
        Self {
            buffer: content,
            dirty: false,
            generation: 0,
            attempts: 0,
            last_flushed: Some(fingerprint),
            applied_write_gen: 0,
            last_edit: None,
            write_chain: None,
        }
    }

    fn unknown_disk(content: String) -> Self {
        Self {
            last_flushed: None,
            ..Self::new(content)
        }
    }

    fn buffer_matches_disk(&self) -> bool {
        self.last_flushed == Some(fs::fingerprint(&self.buffer))
    }
}

/// 退避间隔：base * 2^(attempts-1)，封顶 cap
fn backoff_for(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exp)).min(cap)
}

pub struct AutosaveScheduler {
    handles: FxHashMap<PathBuf, FileHandle>,
    store: FileStore,
    runtime: Handle,
    config: EngineConfig,
    tx: Sender<SchedulerMessage>,
    rx: Receiver<SchedulerMessage>,
}

impl AutosaveScheduler {
    pub fn new(runtime: Handle, store: FileStore, config: EngineConfig) -> Self {
        let (tx, rx) = channel();
        Self {
            handles: FxHashMap::default(),
            store,
            runtime,
            config,
            tx,
            rx,
        }
    }

    /// 登记一个干净的打开文件，已打开的路径保持原状
    pub fn open_file(&mut self, path: &Path, content: String) {
        self.handles
            .entry(path.to_path_buf())
            .or_insert_with(|| FileHandle::new(content));
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.handles.contains_key(path)
    }

    pub fn open_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.handles.keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    pub fn buffer_of(&self, path: &Path) -> Option<&str> {
        self.handles.get(path).map(|h| h.buffer.as_str())
    }

    pub fn is_dirty(&self, path: &Path) -> bool {
        self.handles.get(path).map(|h| h.dirty).unwrap_or(false)
    }

    pub fn dirty_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self
            .handles
            .iter()
            .filter(|(_, h)| h.dirty)
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort_unstable();
        paths
    }

    pub fn has_dirty(&self) -> bool {
        self.handles.values().any(|h| h.dirty)
    }

    /// 最近一次编辑的时刻，跨所有打开文件
    pub fn last_activity(&self) -> Option<Instant> {
        self.handles.values().filter_map(|h| h.last_edit).max()
    }

    /// 编辑入口：更新缓冲、置脏、重置防抖窗口
    ///
    /// 未打开的路径自动登记，磁盘状态按未知处理。
    pub fn register_edit(&mut self, path: &Path, content: String) {
        let handle = self
            .handles
            .entry(path.to_path_buf())
            .or_insert_with(|| FileHandle::unknown_disk(String::new()));

        handle.buffer = content;
        handle.dirty = true;
        handle.attempts = 0;
        handle.generation += 1;
        handle.last_edit = Some(Instant::now());

        let generation = handle.generation;
        self.arm_timer(path.to_path_buf(), generation, self.config.debounce);
    }

    fn arm_timer(&self, path: PathBuf, generation: u64, delay: Duration) {
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SchedulerMessage::TimerFired { path, generation });
        });
    }

    /// 丢弃未保存内容并关闭句柄，挂起的定时器随之作废
    pub fn cancel(&mut self, path: &Path) {
        if self.handles.remove(path).is_some() {
            tracing::debug!(path = %path.display(), "pending save cancelled");
        }
    }

    /// 把句柄挪到新路径，旧路径的定时器自然作废
    ///
    /// 调用方先对旧路径 flush，确保没有在途写再挪。
    pub fn rename(&mut self, from: &Path, to: &Path) {
        if let Some(handle) = self.handles.remove(from) {
            self.handles.insert(to.to_path_buf(), handle);
        }
    }

    /// 处理积累的内部消息，返回需要上报的保存结局
    pub fn pump(&mut self) -> Vec<SaveOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            match message {
                SchedulerMessage::TimerFired { path, generation } => {
                    self.on_timer_fired(&path, generation);
                }
                SchedulerMessage::WriteFinished {
                    path,
                    generation,
                    content,
                    result,
                } => {
                    if let Some(outcome) = self.on_write_finished(path, generation, content, result)
                    {
                        outcomes.push(outcome);
                    }
                }
            }
        }
        outcomes
    }

    fn on_timer_fired(&mut self, path: &Path, generation: u64) {
        let Some(handle) = self.handles.get_mut(path) else {
            return;
        };
        // 世代前进意味着有更新的编辑接管了这个窗口
        if handle.generation != generation || !handle.dirty {
            return;
        }
        if handle.buffer_matches_disk() {
            handle.dirty = false;
            handle.attempts = 0;
            tracing::debug!(path = %path.display(), "buffer matches disk, write skipped");
            return;
        }
        self.start_write(path);
    }

    /// 发起一次后台写，链在上一次写之后
    fn start_write(&mut self, path: &Path) {
        let io_timeout = self.config.io_timeout;
        let Some(handle) = self.handles.get_mut(path) else {
            return;
        };
        handle.attempts += 1;

        let snapshot: Arc<str> = Arc::from(handle.buffer.as_str());
        let generation = handle.generation;
        let previous = handle.write_chain.take();

        let store = self.store.clone();
        let tx = self.tx.clone();
        let task_path = path.to_path_buf();
        let task_content = Arc::clone(&snapshot);

        let join = self.runtime.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = store
                .write_atomic_timed(&task_path, &task_content, io_timeout)
                .await;
            let _ = tx.send(SchedulerMessage::WriteFinished {
                path: task_path,
                generation,
                content: task_content,
                result,
            });
        });

        if let Some(handle) = self.handles.get_mut(path) {
            handle.write_chain = Some(join);
        }
    }

    fn on_write_finished(
        &mut self,
        path: PathBuf,
        generation: u64,
        content: Arc<str>,
        result: Result<(), FsError>,
    ) -> Option<SaveOutcome> {
        let Some(handle) = self.handles.get_mut(&path) else {
            // 句柄已被关闭或丢弃，但落盘成功仍是事实，索引要知道
            return match result {
                Ok(()) => Some(SaveOutcome::Saved { path, content }),
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "write for closed file failed");
                    None
                }
            };
        };

        match result {
            Ok(()) => {
                // 屏障 flush 可能已经写入更新的内容，迟到的旧回执不得回退状态
                if generation < handle.applied_write_gen {
                    tracing::debug!(path = %path.display(), "dropping receipt of a superseded write");
                    return None;
                }
                handle.applied_write_gen = generation;
                handle.last_flushed = Some(fs::fingerprint(&content));
                if handle.generation == generation {
                    handle.dirty = false;
                    handle.attempts = 0;
                } else {
                    tracing::debug!(path = %path.display(), "write landed but newer edit pending");
                }
                Some(SaveOutcome::Saved { path, content })
            }
            Err(error) => {
                if handle.generation != generation {
                    // 新编辑已经重置了重试周期，由它的定时器接管
                    tracing::warn!(path = %path.display(), error = %error, "superseded write failed");
                    return None;
                }
                let attempts = handle.attempts;
                if error.class() == ErrorClass::Transient && attempts < self.config.max_retries {
                    let delay =
                        backoff_for(attempts, self.config.retry_base, self.config.retry_cap);
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient write failure, retrying"
                    );
                    self.arm_timer(path, generation, delay);
                    None
                } else {
                    tracing::error!(
                        path = %path.display(),
                        error = %error,
                        attempts,
                        "save failed, keeping dirty buffer"
                    );
                    Some(SaveOutcome::Failed {
                        path,
                        error: error.to_string(),
                        attempts,
                    })
                }
            }
        }
    }

    /// 同步屏障：等待该路径在途写完成，再把当前缓冲写盘
    ///
    /// 只尝试一次，瞬态失败也立即报告，由调用方决定后续。
    pub fn flush(&mut self, path: &Path) -> FlushOutcome {
        let io_timeout = self.config.io_timeout;
        let store = self.store.clone();

        let Some(handle) = self.handles.get_mut(path) else {
            return FlushOutcome::Clean;
        };
        if !handle.dirty {
            return FlushOutcome::Clean;
        }
        if handle.buffer_matches_disk() {
            handle.dirty = false;
            handle.attempts = 0;
            return FlushOutcome::Clean;
        }

        // 作废挂起的防抖定时器，这次写由当前调用负责
        handle.generation += 1;
        handle.attempts += 1;
        let generation = handle.generation;
        let attempts = handle.attempts;
        let snapshot: Arc<str> = Arc::from(handle.buffer.as_str());
        let previous = handle.write_chain.take();

        let task_content = Arc::clone(&snapshot);
        let task_path = path.to_path_buf();
        let result = self.runtime.block_on(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            store
                .write_atomic_timed(&task_path, &task_content, io_timeout)
                .await
        });

        let handle = match self.handles.get_mut(path) {
            Some(h) => h,
            None => return FlushOutcome::Clean,
        };
        match result {
            Ok(()) => {
                handle.applied_write_gen = generation;
                handle.last_flushed = Some(fs::fingerprint(&snapshot));
                handle.dirty = false;
                handle.attempts = 0;
                FlushOutcome::Saved(snapshot)
            }
            Err(error) => {
                tracing::error!(path = %path.display(), error = %error, "flush failed");
                // 屏障本身只试一次，但瞬态失败后退避重试照常接管这个脏缓冲
                if error.is_transient() && attempts < self.config.max_retries {
                    let delay =
                        backoff_for(attempts, self.config.retry_base, self.config.retry_cap);
                    self.arm_timer(path.to_path_buf(), generation, delay);
                }
                FlushOutcome::Failed {
                    error: error.to_string(),
                    attempts,
                }
            }
        }
    }

    /// 对所有脏文件执行 flush，逐路径报告结局
    ///
    /// 遇到失败不中断，调用方拿到完整清单后自行裁决。
    pub fn flush_all(&mut self) -> Vec<(PathBuf, FlushOutcome)> {
        let paths = self.dirty_paths();
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let outcome = self.flush(&path);
            results.push((path, outcome));
        }
        results
    }

    /// flush 后关闭句柄；失败时句柄保留，脏内容不丢
    pub fn close_file(&mut self, path: &Path) -> FlushOutcome {
        let outcome = self.flush(path);
        if !outcome.is_failed() {
            self.handles.remove(path);
        }
        outcome
    }
}

#[cfg(test)]
#[path = "../../tests/unit/autosave.rs"]
mod tests;
