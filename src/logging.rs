//! tracing 初始化：滚动日志文件 + 转发给宿主的镜像通道
//!
//! 引擎作为库嵌入宿主应用，日志先落到数据目录下的滚动文件，
//! 同时逐行镜像到一个 channel，宿主可以把它渲染进自己的界面。

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub struct LoggingGuard {
    _guard: WorkerGuard,
    log_dir: PathBuf,
    log_rx: Option<Receiver<String>>,
}

impl LoggingGuard {
    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }

    /// 宿主取走镜像接收端，只能取一次
    pub fn take_log_rx(&mut self) -> Option<Receiver<String>> {
        self.log_rx.take()
    }
}

struct MirrorWriter {
    buf: Vec<u8>,
    tx: Sender<String>,
}

impl MirrorWriter {
    fn new(tx: Sender<String>) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            tx,
        }
    }
}

impl Write for MirrorWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MirrorWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }

        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines() {
            let _ = self.tx.send(line.to_string());
        }
    }
}

#[derive(Clone)]
struct TeeMakeWriter {
    file: NonBlocking,
    tx: Sender<String>,
}

struct TeeWriter {
    file: NonBlocking,
    mirror: MirrorWriter,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.make_writer(),
            mirror: MirrorWriter::new(self.tx.clone()),
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        let _ = self.mirror.write_all(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.mirror.flush()?;
        Ok(())
    }
}

/// 初始化全局 tracing，日志落在配置的数据目录下，返回的 guard 维持后台写线程存活
///
/// 目录建不出来或已经有订阅者时返回 None，嵌入方自己的初始化优先。
pub fn init(config: &crate::config::EngineConfig) -> Option<LoggingGuard> {
    let log_dir = config.ensure_log_dir().ok()?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "zwrite.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let (log_tx, log_rx) = mpsc::channel::<String>();
    let writer = TeeMakeWriter {
        file: non_blocking,
        tx: log_tx,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zwrite=info"));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true),
    );

    if subscriber.try_init().is_err() {
        return None;
    }

    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!(panic = %panic_info, "panic");
    }));

    tracing::info!(log_dir = %log_dir.display(), "tracing initialized");

    Some(LoggingGuard {
        _guard: guard,
        log_dir,
        log_rx: Some(log_rx),
    })
}
