//! zwrite - 笔记应用的工作区与持久化引擎
//!
//! 模块结构：
//! - engine: 门面，聚合各子系统并由宿主线程驱动
//! - autosave: 防抖自动保存调度与重试
//! - fs: 原子文件存取与外部修改监视
//! - index: 文件名/内容模糊索引与后台重建
//! - workspace: 命名工作区、最近文件、收藏目录的持久记录
//! - events: 引擎对宿主的事件通道
//! - config / logging / runtime: 周边设施

pub mod autosave;
pub mod config;
pub mod engine;
pub mod events;
pub mod fs;
pub mod index;
pub mod logging;
pub mod runtime;
pub mod workspace;
