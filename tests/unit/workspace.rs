use super::*;

use tempfile::TempDir;

use crate::fs::FileStore;

fn create_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn init_without_file_creates_default_workspace() {
    let dir = TempDir::new().unwrap();
    let store = WorkspaceStore::load_or_init(dir.path().join("workspaces.json")).unwrap();
    assert_eq!(store.active_id(), 1);
    assert_eq!(store.list(), vec![1]);
    assert!(store.get(1).unwrap().open_files.is_empty());
}

#[test]
fn round_trip_preserves_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workspaces.json");
    let runtime = create_runtime();
    let file_store = FileStore::new();

    let mut store = WorkspaceStore::load_or_init(path.clone()).unwrap();
    store.record_pane_open(1, Path::new("/notes/a.md"), 0);
    store.record_pane_open(1, Path::new("/notes/b.md"), 1);
    store.update_cursor(1, Path::new("/notes/a.md"), 42);
    store.set_folder_expanded(1, Path::new("/notes"), true);
    store.ensure(2).unwrap();
    store.record_pane_open(2, Path::new("/scratch.md"), 0);
    store.set_active(2).unwrap();
    store.persist(runtime.handle(), &file_store).unwrap();

    let reloaded = WorkspaceStore::load_or_init(path).unwrap();
    assert_eq!(reloaded.active_id(), 2);
    assert_eq!(reloaded.list(), vec![1, 2]);

    let one = reloaded.get(1).unwrap();
    assert_eq!(one.open_files.len(), 2);
    assert_eq!(one.open_files[0].path, PathBuf::from("/notes/a.md"));
    assert_eq!(one.open_files[0].cursor, 42);
    assert_eq!(one.open_files[1].pane_slot, 1);
    assert_eq!(one.expanded_folders, vec![PathBuf::from("/notes")]);

    let two = reloaded.get(2).unwrap();
    assert_eq!(two.open_paths(), vec![PathBuf::from("/scratch.md")]);
    assert!(two.last_active_unix > 0);
}

#[test]
fn unknown_fields_are_ignored() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workspaces.json");
    std::fs::write(
        &path,
        r#"{
            "format_version": 9,
            "active_id": 1,
            "color_theme": "sepia",
            "workspaces": [
                {"id": 1, "open_files": [], "window_geometry": [800, 600]}
            ]
        }"#,
    )
    .unwrap();

    let store = WorkspaceStore::load_or_init(path).unwrap();
    assert_eq!(store.active_id(), 1);
    assert_eq!(store.list(), vec![1]);
}

#[test]
fn missing_fields_take_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workspaces.json");
    std::fs::write(&path, r#"{"format_version": 1, "workspaces": [{"id": 3}]}"#).unwrap();

    let store = WorkspaceStore::load_or_init(path).unwrap();
    // active_id 缺省为 1，但 1 不存在，回退到现存的最小 id
    assert_eq!(store.active_id(), 3);
    let snapshot = store.get(3).unwrap();
    assert!(snapshot.open_files.is_empty());
    assert!(snapshot.expanded_folders.is_empty());
    assert_eq!(snapshot.last_active_unix, 0);
}

#[test]
fn invalid_ids_are_dropped_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workspaces.json");
    std::fs::write(
        &path,
        r#"{
            "format_version": 1,
            "active_id": 7,
            "workspaces": [{"id": 0}, {"id": 2}, {"id": 9}]
        }"#,
    )
    .unwrap();

    let store = WorkspaceStore::load_or_init(path).unwrap();
    assert_eq!(store.list(), vec![2]);
    assert_eq!(store.active_id(), 2);
}

#[test]
fn corrupt_payload_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workspaces.json");
    std::fs::write(&path, "not json at all").unwrap();
    assert!(matches!(
        WorkspaceStore::load_or_init(path),
        Err(WorkspaceError::Payload(_))
    ));
}

#[test]
fn upsert_validates_id_range() {
    let dir = TempDir::new().unwrap();
    let mut store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();
    assert!(matches!(
        store.upsert(WorkspaceSnapshot::empty(0)),
        Err(WorkspaceError::InvalidId(0))
    ));
    assert!(matches!(
        store.upsert(WorkspaceSnapshot::empty(5)),
        Err(WorkspaceError::InvalidId(5))
    ));
    store.upsert(WorkspaceSnapshot::empty(4)).unwrap();
    assert_eq!(store.list(), vec![1, 4]);
}

#[test]
fn ensure_creates_missing_workspaces_within_range() {
    let dir = TempDir::new().unwrap();
    let mut store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();
    store.ensure(3).unwrap();
    store.ensure(2).unwrap();
    assert_eq!(store.list(), vec![1, 2, 3]);
    assert!(matches!(store.ensure(5), Err(WorkspaceError::InvalidId(5))));
}

#[test]
fn active_workspace_cannot_be_deleted() {
    let dir = TempDir::new().unwrap();
    let mut store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();
    store.ensure(2).unwrap();
    assert!(matches!(store.delete(1), Err(WorkspaceError::DeleteActive)));
    assert!(store.delete(2).unwrap());
    assert!(!store.delete(2).unwrap());
}

#[test]
fn pane_records_update_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let mut store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();
    let path = Path::new("/a.md");

    assert!(store.record_pane_open(1, path, 0));
    assert!(!store.record_pane_open(1, path, 0));
    assert!(store.record_pane_open(1, path, 2));
    assert_eq!(store.get(1).unwrap().open_files.len(), 1);
    assert_eq!(store.get(1).unwrap().open_files[0].pane_slot, 2);

    assert!(store.record_pane_close(1, path));
    assert!(!store.record_pane_close(1, path));
}

#[test]
fn cursor_updates_only_for_open_files() {
    let dir = TempDir::new().unwrap();
    let mut store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();
    let path = Path::new("/a.md");

    assert!(!store.update_cursor(1, path, 10));
    store.record_pane_open(1, path, 0);
    assert!(store.update_cursor(1, path, 10));
    assert!(!store.update_cursor(1, path, 10));
}

#[test]
fn expanded_folders_form_a_sorted_set() {
    let dir = TempDir::new().unwrap();
    let mut store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();

    assert!(store.set_folder_expanded(1, Path::new("/b"), true));
    assert!(store.set_folder_expanded(1, Path::new("/a"), true));
    assert!(!store.set_folder_expanded(1, Path::new("/a"), true));
    assert_eq!(
        store.get(1).unwrap().expanded_folders,
        vec![PathBuf::from("/a"), PathBuf::from("/b")]
    );

    assert!(store.set_folder_expanded(1, Path::new("/a"), false));
    assert!(!store.set_folder_expanded(1, Path::new("/a"), false));
}

#[test]
fn snapshot_of_missing_id_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();
    assert!(matches!(store.snapshot(3), Err(WorkspaceError::InvalidId(3))));
}

#[test]
fn display_name_falls_back_to_numbered_default() {
    let dir = TempDir::new().unwrap();
    let mut store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();
    assert_eq!(store.get(1).unwrap().display_name(), "Workspace 1");

    store.rename(1, "research notes").unwrap();
    assert_eq!(store.get(1).unwrap().display_name(), "research notes");
    assert!(matches!(
        store.rename(3, "nope"),
        Err(WorkspaceError::InvalidId(3))
    ));
}

#[test]
fn rename_path_updates_open_records() {
    let dir = TempDir::new().unwrap();
    let mut store = WorkspaceStore::load_or_init(dir.path().join("w.json")).unwrap();
    store.record_pane_open(1, Path::new("/old.md"), 0);
    store.update_cursor(1, Path::new("/old.md"), 7);

    assert!(store.rename_path(1, Path::new("/old.md"), Path::new("/new.md")));
    assert!(!store.rename_path(1, Path::new("/old.md"), Path::new("/new.md")));

    let snapshot = store.get(1).unwrap();
    assert_eq!(snapshot.open_files[0].path, PathBuf::from("/new.md"));
    assert_eq!(snapshot.open_files[0].cursor, 7);
}
