//! 后台索引重建
//!
//! 全量扫描走 spawn_blocking，期间旧索引继续服务查询。
//! 扫描结果作为完整条目集一次性交回，由调用方整体换入，
//! 查询永远不会看到半新半旧的索引。
//!
//! - 使用 ignore crate 遵守 .gitignore 规则
//! - 自动跳过二进制文件和超大文件
//! - 支持取消，取消后旧索引原样保留

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use ignore::WalkBuilder;

use super::{EntryMap, IndexEntry};
use crate::fs::is_likely_binary;

static REBUILD_ID: AtomicU64 = AtomicU64::new(0);

fn next_rebuild_id() -> u64 {
    REBUILD_ID.fetch_add(1, Ordering::Relaxed)
}

/// 每索引这么多文件上报一次进度
const PROGRESS_BATCH: usize = 64;

/// 扫描参数，从引擎配置里抽取
#[derive(Debug, Clone, Copy)]
pub struct RebuildLimits {
    pub max_file_size: u64,
    pub max_excerpt_lines: usize,
    pub max_excerpt_len: usize,
}

#[derive(Debug)]
pub enum RebuildMessage {
    Progress {
        rebuild_id: u64,
        /// 已处理文件数占总数的百分比，0..100
        percent: u8,
    },
    /// 扫描完成，entries 为完整的新条目集
    Built {
        rebuild_id: u64,
        entries: EntryMap,
        indexed: usize,
        skipped: usize,
    },
    Cancelled {
        rebuild_id: u64,
    },
}

/// 重建任务句柄，用于取消
pub struct RebuildTask {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl RebuildTask {
    fn new() -> Self {
        Self {
            id: next_rebuild_id(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn cancelled_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

/// 启动一次全量重建
///
/// 返回 RebuildTask 用于取消。结果通过 tx 送回，调用方自己决定
/// 何时换入。
pub fn spawn_rebuild(
    runtime: tokio::runtime::Handle,
    roots: Vec<PathBuf>,
    limits: RebuildLimits,
    tx: Sender<RebuildMessage>,
) -> RebuildTask {
    let task = RebuildTask::new();
    let rebuild_id = task.id();
    let cancelled = task.cancelled_flag();
    let tx_for_outcome = tx.clone();

    runtime.spawn(async move {
        // 扫描在阻塞任务中执行
        let result = tokio::task::spawn_blocking(move || {
            rebuild_sync(&roots, limits, rebuild_id, &cancelled, &tx)
        })
        .await;

        match result {
            Ok(Some((entries, indexed, skipped))) => {
                let _ = tx_for_outcome.send(RebuildMessage::Built {
                    rebuild_id,
                    entries,
                    indexed,
                    skipped,
                });
            }
            Ok(None) | Err(_) => {
                let _ = tx_for_outcome.send(RebuildMessage::Cancelled { rebuild_id });
            }
        }
    });

    task
}

/// 同步扫描，取消时返回 None
///
/// 两遍走完：第一遍只收集候选路径，有了总数第二遍才能按
/// 百分比上报进度。
fn rebuild_sync(
    roots: &[PathBuf],
    limits: RebuildLimits,
    rebuild_id: u64,
    cancelled: &AtomicBool,
    tx: &Sender<RebuildMessage>,
) -> Option<(EntryMap, usize, usize)> {
    let mut files = Vec::new();
    for root in roots {
        let walker = WalkBuilder::new(root)
            .hidden(true) // 跳过隐藏文件
            .git_ignore(true) // 遵守 .gitignore
            .git_global(true)
            .git_exclude(true)
            .build();

        for entry in walker.flatten() {
            if cancelled.load(Ordering::Relaxed) {
                return None;
            }
            let path = entry.path();
            if path.is_file() {
                files.push(path.to_path_buf());
            }
        }
    }

    let total = files.len();
    let mut entries = EntryMap::default();
    let mut indexed = 0usize;
    let mut skipped = 0usize;

    for (done, path) in files.iter().enumerate() {
        if cancelled.load(Ordering::Relaxed) {
            return None;
        }

        if done > 0 && done % PROGRESS_BATCH == 0 {
            let _ = tx.send(RebuildMessage::Progress {
                rebuild_id,
                percent: (done * 100 / total) as u8,
            });
        }

        // 超大文件不读直接跳过
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > limits.max_file_size => {
                skipped += 1;
                continue;
            }
            Ok(_) => {}
            Err(_) => {
                skipped += 1;
                continue;
            }
        }

        let content = match std::fs::read(path) {
            Ok(c) => c,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        if is_likely_binary(&content) {
            skipped += 1;
            continue;
        }

        let text = match std::str::from_utf8(&content) {
            Ok(t) => t,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        entries.insert(
            path.clone(),
            IndexEntry::build(path, text, limits.max_excerpt_lines, limits.max_excerpt_len),
        );
        indexed += 1;
    }

    Some((entries, indexed, skipped))
}
