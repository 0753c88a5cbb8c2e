//! 文件存取层
//!
//! 所有落盘都走原子写：先写同目录下的临时文件，再 rename 到目标路径。
//! 崩溃时磁盘上要么是旧内容要么是新内容，不会出现半截文件。
//!
//! 错误分为瞬态和永久两类，上层据此决定重试还是上报。

pub mod watcher;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// 临时文件名去重计数
static TMP_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_tmp_id() -> u64 {
    TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("path has no parent directory: {0}")]
    NoParent(PathBuf),
    #[error("path has no file name: {0}")]
    NoFileName(PathBuf),
    #[error("file too large: {0} bytes")]
    TooLarge(u64),
    #[error("binary content")]
    Binary,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 错误的重试语义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 值得退避重试：锁冲突、超时、中断
    Transient,
    /// 重试无意义：路径失效、参数非法、内容不可索引
    Permanent,
}

impl FsError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FsError::NoParent(_) | FsError::NoFileName(_) => ErrorClass::Permanent,
            FsError::TooLarge(_) | FsError::Binary => ErrorClass::Permanent,
            FsError::Io(e) => classify_io(e),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// 按 ErrorKind 分类
///
/// Windows 上另一进程持有文件锁时表现为 PermissionDenied，
/// 所以它归入瞬态；真正的权限问题会在重试耗尽后升级为永久失败。
fn classify_io(e: &io::Error) -> ErrorClass {
    use io::ErrorKind::*;
    match e.kind() {
        NotFound | InvalidInput | InvalidData | Unsupported | UnexpectedEof => {
            ErrorClass::Permanent
        }
        PermissionDenied | TimedOut | Interrupted | WouldBlock => ErrorClass::Transient,
        // 未识别的错误按瞬态处理，重试上限兜底
        _ => ErrorClass::Transient,
    }
}

/// 内容指纹，用于判断磁盘内容是否与内存一致
pub fn fingerprint(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// 前 8KB 内出现 NUL 字节即视为二进制文件
pub fn is_likely_binary(bytes: &[u8]) -> bool {
    let probe = &bytes[..bytes.len().min(8192)];
    memchr::memchr(0, probe).is_some()
}

/// 累计 IO 计数，测试和诊断用
#[derive(Debug, Default)]
pub struct FileStoreStats {
    pub writes_started: AtomicU64,
    pub writes_completed: AtomicU64,
    pub writes_failed: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl FileStoreStats {
    pub fn writes_completed(&self) -> u64 {
        self.writes_completed.load(Ordering::Relaxed)
    }

    pub fn writes_failed(&self) -> u64 {
        self.writes_failed.load(Ordering::Relaxed)
    }
}

/// 文件存取入口，内部只有计数器，可廉价克隆
#[derive(Clone, Default)]
pub struct FileStore {
    stats: Arc<FileStoreStats>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<FileStoreStats> {
        Arc::clone(&self.stats)
    }

    /// 读取整个文件为字符串
    pub async fn read_to_string(&self, path: &Path) -> Result<String, FsError> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// 为索引读取文件：超大和二进制文件直接拒绝
    pub async fn read_for_index(&self, path: &Path, max_size: u64) -> Result<String, FsError> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.len() > max_size {
            return Err(FsError::TooLarge(meta.len()));
        }
        let bytes = tokio::fs::read(path).await?;
        if is_likely_binary(&bytes) {
            return Err(FsError::Binary);
        }
        String::from_utf8(bytes)
            .map_err(|_| FsError::Io(io::Error::new(io::ErrorKind::InvalidData, "not utf-8")))
    }

    /// 原子写入：临时文件 + rename
    pub async fn write_atomic(&self, path: &Path, content: &str) -> Result<(), FsError> {
        self.stats.writes_started.fetch_add(1, Ordering::Relaxed);
        let result = self.write_atomic_inner(path, content).await;
        match &result {
            Ok(()) => {
                self.stats.writes_completed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_written
                    .fetch_add(content.len() as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.writes_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn write_atomic_inner(&self, path: &Path, content: &str) -> Result<(), FsError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| FsError::NoParent(path.to_path_buf()))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| FsError::NoFileName(path.to_path_buf()))?;

        // 目标是目录时提前报 InvalidInput，rename 的报错因平台而异
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.is_dir() {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "target path is a directory",
                )));
            }
        }

        let tmp_name = format!(".{}.zwrite-{:x}.tmp", file_name.to_string_lossy(), next_tmp_id());
        let tmp_path = parent.join(tmp_name);

        if let Err(e) = tokio::fs::write(&tmp_path, content).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(FsError::Io(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(FsError::Io(e));
        }
        Ok(())
    }

    /// 带超时的原子写入，超时映射为 TimedOut（瞬态）
    pub async fn write_atomic_timed(
        &self,
        path: &Path,
        content: &str,
        timeout: Duration,
    ) -> Result<(), FsError> {
        match tokio::time::timeout(timeout, self.write_atomic(path, content)).await {
            Ok(result) => result,
            Err(_) => Err(FsError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        tokio::fs::rename(from, to).await.map_err(FsError::Io)
    }

    /// 删除文件，目标不存在视为已完成
    pub async fn remove(&self, path: &Path) -> Result<(), FsError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(FsError::Io(err)),
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/fs.rs"]
mod tests;
