use super::*;
use tempfile::TempDir;

fn create_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn test_config(debounce_ms: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.debounce = Duration::from_millis(debounce_ms);
    config.retry_base = Duration::from_millis(10);
    config.retry_cap = Duration::from_millis(40);
    config.max_retries = 3;
    config.io_timeout = Duration::from_secs(5);
    config
}

fn scheduler(rt: &tokio::runtime::Runtime, config: EngineConfig) -> (AutosaveScheduler, FileStore) {
    let store = FileStore::new();
    let sched = AutosaveScheduler::new(rt.handle().clone(), store.clone(), config);
    (sched, store)
}

/// 轮询 pump 直到谓词满足或超时
fn pump_until<F>(sched: &mut AutosaveScheduler, timeout: Duration, mut done: F) -> Vec<SaveOutcome>
where
    F: FnMut(&[SaveOutcome]) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut all = Vec::new();
    loop {
        all.extend(sched.pump());
        if done(&all) || Instant::now() >= deadline {
            return all;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn has_saved(outcomes: &[SaveOutcome]) -> bool {
    outcomes.iter().any(|o| matches!(o, SaveOutcome::Saved { .. }))
}

fn has_failed(outcomes: &[SaveOutcome]) -> bool {
    outcomes.iter().any(|o| matches!(o, SaveOutcome::Failed { .. }))
}

#[test]
fn test_edit_saves_after_debounce_window() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(30));

    sched.register_edit(&path, "final text".to_string());
    assert!(sched.is_dirty(&path));

    let outcomes = pump_until(&mut sched, Duration::from_secs(3), has_saved);
    assert!(has_saved(&outcomes), "expected a save, got {outcomes:?}");
    assert!(!sched.is_dirty(&path));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "final text");
}

#[test]
fn test_burst_of_edits_coalesces_to_one_write() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, store) = scheduler(&rt, test_config(60));
    let stats = store.stats();

    for content in ["v1", "v2", "v3"] {
        sched.register_edit(&path, content.to_string());
        std::thread::sleep(Duration::from_millis(5));
    }

    let outcomes = pump_until(&mut sched, Duration::from_secs(3), has_saved);
    assert!(has_saved(&outcomes));

    // 稍后再排一轮，确认作废的旧定时器没有补写
    std::thread::sleep(Duration::from_millis(150));
    sched.pump();

    assert_eq!(stats.writes_completed(), 1, "burst must coalesce into one write");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "v3");
}

#[test]
fn test_separate_quiet_periods_write_each_time() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, store) = scheduler(&rt, test_config(25));
    let stats = store.stats();

    sched.register_edit(&path, "first".to_string());
    let outcomes = pump_until(&mut sched, Duration::from_secs(3), has_saved);
    assert!(has_saved(&outcomes));

    sched.register_edit(&path, "second".to_string());
    let outcomes = pump_until(&mut sched, Duration::from_secs(3), has_saved);
    assert!(has_saved(&outcomes));

    assert_eq!(stats.writes_completed(), 2);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
}

#[test]
fn test_flush_writes_immediately() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    // 防抖窗口拉长，确认是 flush 在写而不是定时器
    let (mut sched, store) = scheduler(&rt, test_config(10_000));

    sched.register_edit(&path, "flush me".to_string());
    let outcome = sched.flush(&path);

    match outcome {
        FlushOutcome::Saved(content) => assert_eq!(&*content, "flush me"),
        other => panic!("expected Saved, got {other:?}"),
    }
    assert!(!sched.is_dirty(&path));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "flush me");
    assert_eq!(store.stats().writes_completed(), 1);
}

#[test]
fn test_flush_clean_path_is_noop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, store) = scheduler(&rt, test_config(30));

    sched.open_file(&path, "loaded content".to_string());
    assert!(matches!(sched.flush(&path), FlushOutcome::Clean));
    assert!(matches!(sched.flush(Path::new("/never/opened.md")), FlushOutcome::Clean));
    assert_eq!(store.stats().writes_completed(), 0);
}

#[test]
fn test_edit_reverting_to_saved_content_skips_write() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, store) = scheduler(&rt, test_config(10_000));

    sched.open_file(&path, "original".to_string());
    sched.register_edit(&path, "changed".to_string());
    sched.register_edit(&path, "original".to_string());
    assert!(sched.is_dirty(&path));

    assert!(matches!(sched.flush(&path), FlushOutcome::Clean));
    assert!(!sched.is_dirty(&path));
    assert_eq!(store.stats().writes_completed(), 0);
}

#[test]
fn test_permanent_failure_reports_and_keeps_dirty() {
    let dir = TempDir::new().unwrap();
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(20));

    // 目标路径是一个目录，写入永久失败
    sched.register_edit(dir.path(), "doomed".to_string());

    let outcomes = pump_until(&mut sched, Duration::from_secs(3), has_failed);
    let failed = outcomes
        .iter()
        .find_map(|o| match o {
            SaveOutcome::Failed { path, attempts, .. } => Some((path.clone(), *attempts)),
            _ => None,
        })
        .expect("expected a failure outcome");
    assert_eq!(failed.0, dir.path());
    assert_eq!(failed.1, 1, "permanent errors must not be retried");
    assert!(sched.is_dirty(dir.path()));
}

#[test]
fn test_transient_failures_retry_until_exhausted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let mut config = test_config(10);
    // 超时为零让每次写都以瞬态错误收场
    config.io_timeout = Duration::ZERO;
    config.max_retries = 2;
    let (mut sched, _store) = scheduler(&rt, config);

    sched.register_edit(&path, "will time out".to_string());

    let outcomes = pump_until(&mut sched, Duration::from_secs(5), has_failed);
    let attempts = outcomes
        .iter()
        .find_map(|o| match o {
            SaveOutcome::Failed { attempts, .. } => Some(*attempts),
            _ => None,
        })
        .expect("expected exhaustion failure");
    assert_eq!(attempts, 2);
    assert!(sched.is_dirty(&path));
}

/// 推动 pump 直到目标路径的定时器写真正落盘，回执留在队列里不消化
fn pump_until_on_disk(sched: &mut AutosaveScheduler, path: &Path, expect: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        assert!(Instant::now() < deadline, "timer write should land");
        sched.pump();
        let inner = Instant::now() + Duration::from_millis(100);
        while Instant::now() < inner {
            if std::fs::read_to_string(path).ok().as_deref() == Some(expect) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

#[test]
fn test_stale_write_receipt_does_not_regress_flushed_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(20));

    sched.register_edit(&path, "alpha".to_string());
    pump_until_on_disk(&mut sched, &path, "alpha");

    // 旧写的回执尚未消化，新编辑经屏障落盘
    sched.register_edit(&path, "bravo".to_string());
    match sched.flush(&path) {
        FlushOutcome::Saved(content) => assert_eq!(&*content, "bravo"),
        other => panic!("expected Saved, got {other:?}"),
    }

    // 迟到的回执不得以旧内容再报一次 Saved
    let outcomes = pump_until(&mut sched, Duration::from_millis(200), |_| false);
    assert!(
        !outcomes
            .iter()
            .any(|o| matches!(o, SaveOutcome::Saved { content, .. } if &**content == "alpha")),
        "superseded receipt must be dropped, got {outcomes:?}"
    );

    // 指纹也不得回退：改回旧内容时仍然要真正写盘
    sched.register_edit(&path, "alpha".to_string());
    assert!(matches!(sched.flush(&path), FlushOutcome::Saved(_)));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "alpha");
}

#[test]
fn test_failed_transient_flush_arms_backoff_retry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let mut config = test_config(10_000);
    // 超时为零让每次写都以瞬态错误收场
    config.io_timeout = Duration::ZERO;
    config.max_retries = 3;
    let (mut sched, _store) = scheduler(&rt, config);

    sched.register_edit(&path, "stuck".to_string());
    assert!(sched.flush(&path).is_failed());

    // 没有新编辑，退避重试也要继续跑到耗尽
    let outcomes = pump_until(&mut sched, Duration::from_secs(5), has_failed);
    let attempts = outcomes
        .iter()
        .find_map(|o| match o {
            SaveOutcome::Failed { attempts, .. } => Some(*attempts),
            _ => None,
        })
        .expect("retries after a failed flush should run to exhaustion");
    assert_eq!(attempts, 3);
    assert!(sched.is_dirty(&path));
}

#[test]
fn test_failed_permanent_flush_does_not_retry() {
    let dir = TempDir::new().unwrap();
    let rt = create_runtime();
    let (mut sched, store) = scheduler(&rt, test_config(10_000));

    // 目标路径是目录，永久失败，不值得重试
    sched.register_edit(dir.path(), "doomed".to_string());
    assert!(sched.flush(dir.path()).is_failed());

    let outcomes = pump_until(&mut sched, Duration::from_millis(200), |_| false);
    assert!(outcomes.is_empty(), "permanent flush failure must not retry");
    assert_eq!(store.stats().writes_completed(), 0);
    assert!(sched.is_dirty(dir.path()));
}

#[cfg(unix)]
#[test]
fn test_blocked_flush_saves_once_the_disk_recovers() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(10_000));

    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();
    if std::fs::write(dir.path().join("canary.md"), "x").is_ok() {
        // root 不受目录权限约束，该场景无法构造
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    sched.register_edit(&path, "delayed landing".to_string());
    assert!(sched.flush(&path).is_failed());
    assert!(sched.is_dirty(&path));

    // 磁盘恢复可写后，退避重试在没有新编辑的情况下完成保存
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    let outcomes = pump_until(&mut sched, Duration::from_secs(5), has_saved);
    assert!(has_saved(&outcomes), "retry should land, got {outcomes:?}");
    assert!(!sched.is_dirty(&path));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "delayed landing");
}

#[test]
fn test_flush_failure_keeps_dirty() {
    let dir = TempDir::new().unwrap();
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(10_000));

    sched.register_edit(dir.path(), "doomed".to_string());
    let outcome = sched.flush(dir.path());

    assert!(outcome.is_failed());
    assert!(sched.is_dirty(dir.path()));
}

#[test]
fn test_flush_all_reports_every_dirty_path() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.md");
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(10_000));

    sched.register_edit(&good, "saved fine".to_string());
    sched.register_edit(dir.path(), "doomed".to_string());

    let results = sched.flush_all();
    assert_eq!(results.len(), 2);

    let good_outcome = &results.iter().find(|(p, _)| p == &good).unwrap().1;
    assert!(matches!(good_outcome, FlushOutcome::Saved(_)));

    let bad_outcome = &results.iter().find(|(p, _)| p == dir.path()).unwrap().1;
    assert!(bad_outcome.is_failed());

    assert_eq!(std::fs::read_to_string(&good).unwrap(), "saved fine");
    assert!(!sched.is_dirty(&good));
    assert!(sched.is_dirty(dir.path()));
}

#[test]
fn test_cancel_aborts_pending_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, store) = scheduler(&rt, test_config(20));

    sched.register_edit(&path, "discarded".to_string());
    sched.cancel(&path);

    std::thread::sleep(Duration::from_millis(100));
    let outcomes = sched.pump();
    assert!(outcomes.is_empty());
    assert!(!sched.is_open(&path));
    assert_eq!(store.stats().writes_completed(), 0);
    assert!(!path.exists());
}

#[test]
fn test_close_file_flushes_and_forgets() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(10_000));

    sched.register_edit(&path, "closing words".to_string());
    let outcome = sched.close_file(&path);

    assert!(matches!(outcome, FlushOutcome::Saved(_)));
    assert!(!sched.is_open(&path));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "closing words");
}

#[test]
fn test_close_file_on_failure_keeps_handle() {
    let dir = TempDir::new().unwrap();
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(10_000));

    sched.register_edit(dir.path(), "doomed".to_string());
    let outcome = sched.close_file(dir.path());

    assert!(outcome.is_failed());
    assert!(sched.is_open(dir.path()));
    assert!(sched.is_dirty(dir.path()));
}

#[test]
fn test_register_edit_auto_opens_unknown_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("new.md");
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(30));

    sched.register_edit(&path, "fresh".to_string());
    assert!(sched.is_open(&path));
    assert!(sched.is_dirty(&path));
    assert_eq!(sched.buffer_of(&path), Some("fresh"));
    assert!(sched.last_activity().is_some());
}

#[test]
fn test_open_file_does_not_clobber_existing_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(10_000));

    sched.register_edit(&path, "unsaved work".to_string());
    sched.open_file(&path, "disk version".to_string());

    assert_eq!(sched.buffer_of(&path), Some("unsaved work"));
    assert!(sched.is_dirty(&path));
}

#[test]
fn test_dirty_paths_are_sorted() {
    let dir = TempDir::new().unwrap();
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(10_000));

    sched.register_edit(&dir.path().join("b.md"), "b".to_string());
    sched.register_edit(&dir.path().join("a.md"), "a".to_string());
    sched.open_file(&dir.path().join("clean.md"), "c".to_string());

    assert_eq!(
        sched.dirty_paths(),
        vec![dir.path().join("a.md"), dir.path().join("b.md")]
    );
    assert!(sched.has_dirty());
}

#[test]
fn test_backoff_doubles_and_caps() {
    let base = Duration::from_millis(10);
    let cap = Duration::from_millis(80);
    assert_eq!(backoff_for(1, base, cap), Duration::from_millis(10));
    assert_eq!(backoff_for(2, base, cap), Duration::from_millis(20));
    assert_eq!(backoff_for(3, base, cap), Duration::from_millis(40));
    assert_eq!(backoff_for(4, base, cap), Duration::from_millis(80));
    assert_eq!(backoff_for(9, base, cap), Duration::from_millis(80));
}

#[test]
fn test_rename_carries_buffer_and_dirty_state() {
    let dir = TempDir::new().unwrap();
    let from = dir.path().join("old.md");
    let to = dir.path().join("new.md");
    let rt = create_runtime();
    let (mut sched, _store) = scheduler(&rt, test_config(10_000));

    sched.register_edit(&from, "carried".to_string());
    sched.rename(&from, &to);

    assert!(!sched.is_open(&from));
    assert_eq!(sched.buffer_of(&to), Some("carried"));
    assert!(sched.is_dirty(&to));
}
