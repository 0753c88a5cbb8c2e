//! 引擎配置与数据目录管理
//!
//! 跨平台的应用数据路径，类似 VS Code 的逻辑：
//! - macOS: ~/Library/Application Support/zwrite/
//! - Linux: ~/.local/share/zwrite/
//! - Windows: %APPDATA%\zwrite\
//!
//! 配置文件为 JSON，未知字段忽略、缺失字段取默认值，保证向前兼容。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const APP_NAME: &str = "zwrite";
const LOG_DIR: &str = "logs";
const SETTINGS_FILE: &str = "settings.json";
const WORKSPACES_FILE: &str = "workspaces.json";
const RECENT_FILE: &str = "recent.json";
const FAVORITES_FILE: &str = "favorites.json";

/// 获取应用数据目录
pub fn get_app_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs_path_macos()
    }

    #[cfg(target_os = "linux")]
    {
        dirs_path_linux()
    }

    #[cfg(target_os = "windows")]
    {
        dirs_path_windows()
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

#[cfg(target_os = "macos")]
fn dirs_path_macos() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join("Library/Application Support").join(APP_NAME))
}

#[cfg(target_os = "linux")]
fn dirs_path_linux() -> Option<PathBuf> {
    // 优先使用 XDG_DATA_HOME，否则使用 ~/.local/share
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        Some(PathBuf::from(xdg).join(APP_NAME))
    } else {
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".local/share").join(APP_NAME))
    }
}

#[cfg(target_os = "windows")]
fn dirs_path_windows() -> Option<PathBuf> {
    std::env::var("APPDATA")
        .ok()
        .map(|appdata| PathBuf::from(appdata).join(APP_NAME))
}

/// 引擎运行配置
///
/// 所有时间参数集中在这里，测试可以注入缩短的间隔。
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 数据目录：工作区记录、最近文件等都存放在这里
    pub data_dir: PathBuf,
    /// 自动保存防抖窗口：最后一次编辑后的静默时长
    pub debounce: Duration,
    /// 重试退避的初始间隔
    pub retry_base: Duration,
    /// 重试退避的上限
    pub retry_cap: Duration,
    /// 瞬态错误的最大自动重试次数，超过后上报为永久失败
    pub max_retries: u32,
    /// 单次文件读写的超时
    pub io_timeout: Duration,
    /// 游标/折叠状态的空闲检查点间隔
    pub checkpoint_idle: Duration,
    /// 索引跳过超过此大小的文件
    pub index_max_file_size: u64,
    /// 每个文件缓存的内容摘录行数上限
    pub index_max_excerpt_lines: usize,
    /// 单条摘录的最大字符数
    pub index_max_excerpt_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: get_app_data_dir().unwrap_or_else(|| PathBuf::from(".zwrite")),
            debounce: Duration::from_secs(5),
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(30),
            max_retries: 5,
            io_timeout: Duration::from_secs(10),
            checkpoint_idle: Duration::from_secs(10),
            index_max_file_size: 1024 * 1024,
            index_max_excerpt_lines: 500,
            index_max_excerpt_len: 160,
        }
    }
}

impl EngineConfig {
    /// 工作区记录文件路径
    pub fn workspaces_path(&self) -> PathBuf {
        self.data_dir.join(WORKSPACES_FILE)
    }

    /// 最近文件记录路径
    pub fn recent_path(&self) -> PathBuf {
        self.data_dir.join(RECENT_FILE)
    }

    /// 收藏目录记录路径
    pub fn favorites_path(&self) -> PathBuf {
        self.data_dir.join(FAVORITES_FILE)
    }

    /// 日志目录，数据目录下的 logs/
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(LOG_DIR)
    }

    /// 确保日志目录存在
    pub fn ensure_log_dir(&self) -> std::io::Result<PathBuf> {
        let dir = self.log_dir();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    /// 确保数据目录存在
    pub fn ensure_data_dir(&self) -> std::io::Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)?;
        }
        Ok(())
    }

    /// 应用设置文件中出现的字段，缺失的保持当前值
    pub fn apply_settings(&mut self, settings: &EngineSettings) {
        if let Some(ms) = settings.debounce_ms {
            self.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.retry_base_ms {
            self.retry_base = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.retry_cap_ms {
            self.retry_cap = Duration::from_millis(ms);
        }
        if let Some(n) = settings.max_retries {
            self.max_retries = n;
        }
        if let Some(ms) = settings.io_timeout_ms {
            self.io_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = settings.checkpoint_idle_secs {
            self.checkpoint_idle = Duration::from_secs(secs);
        }
        if let Some(bytes) = settings.index_max_file_size {
            self.index_max_file_size = bytes;
        }
    }
}

/// 设置文件的序列化形态
///
/// 字段全部可选：旧版本写出的文件在新版本下照常读取，反之亦然。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_cap_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_idle_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_max_file_size: Option<u64>,
}

/// 获取设置文件路径
pub fn get_settings_path() -> Option<PathBuf> {
    get_app_data_dir().map(|dir| dir.join(SETTINGS_FILE))
}

/// 确保设置文件存在，不存在时写入默认内容
pub fn ensure_settings_file() -> std::io::Result<PathBuf> {
    let path = get_settings_path().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Cannot determine settings directory",
        )
    })?;
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if !path.exists() {
        let content = serde_json::to_string_pretty(&EngineSettings::default())
            .unwrap_or_else(|_| "{}".to_string());
        std::fs::write(&path, content)?;
    }
    Ok(path)
}

/// 从设置文件加载，失败时返回 None（调用方回落到默认配置）
pub fn load_settings() -> Option<EngineSettings> {
    let path = get_settings_path()?;
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}
