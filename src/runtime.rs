//! 后台任务运行时：2 个工作线程的 tokio 多线程运行时

use std::future::Future;
use std::io;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// 引擎私有的异步运行时
///
/// 定时器、文件写入、目录扫描都跑在这里，调用线程（UI 线程）
/// 只通过消息与其交互，绝不被 IO 阻塞。
pub struct EngineRuntime {
    runtime: Runtime,
}

impl EngineRuntime {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("zwrite-worker")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// 获取句柄，可跨线程克隆
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// 在调用线程上同步等待一个 future 完成
    ///
    /// 仅用于屏障式操作（flush、切换工作区），日常保存一律走 spawn。
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
