//! Full cycles over the disk adapters and an in-memory store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use vaultsync_common::{ItemKind, SyncPath};
use vaultsync_storage::{CloudStore, MemoryStore};
use vaultsync_sync::{
    ChangeSignal, Delta, IgnoreRules, PairConfig, RemoteAdapter, RemoteFs, StoreConfig,
    SyncConfig, SyncMode, SyncPair, TypeClash, LOCAL_TRASH_DIR,
};

fn p(s: &str) -> SyncPath {
    SyncPath::parse(s).unwrap()
}

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    config: SyncConfig,
    pair_config: PairConfig,
    store: Arc<MemoryStore>,
}

impl Fixture {
    fn new(mode: SyncMode) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("local");
        fs::create_dir_all(&root).unwrap();

        let config = SyncConfig::new(
            temp.path().join("db"),
            StoreConfig {
                kind: "memory".to_string(),
                config: serde_json::Value::Null,
            },
        );
        let mut pair_config = PairConfig::new("docs", &root);
        pair_config.remote_path = "/Docs".to_string();
        pair_config.mode = mode;

        Self {
            _temp: temp,
            root,
            config,
            pair_config,
            store: Arc::new(MemoryStore::new()),
        }
    }

    async fn open(&self) -> SyncPair {
        let store: Arc<dyn CloudStore> = self.store.clone();
        SyncPair::open(&self.config, &self.pair_config, store)
            .await
            .unwrap()
    }

    fn write(&self, rel: &str, data: &[u8]) {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn read(&self, rel: &str) -> Vec<u8> {
        fs::read(self.root.join(rel)).unwrap()
    }

    async fn remote_root(&self) -> String {
        let nodes = self.store.list_tree(self.store.root_id()).await.unwrap();
        nodes
            .into_iter()
            .find(|n| n.name == "Docs" && n.parent == self.store.root_id())
            .unwrap()
            .id
    }

    async fn remote_root_or_create(&self) -> String {
        self.store
            .create_dir(self.store.root_id(), "Docs")
            .await
            .unwrap()
            .id
    }

    /// Remote paths below the pair root, listed afresh.
    async fn remote_paths(&self) -> Vec<String> {
        let store: Arc<dyn CloudStore> = self.store.clone();
        let ignore = Arc::new(IgnoreRules::new(&self.root, &[]).unwrap());
        let remote = RemoteFs::new(
            store,
            self.remote_root().await,
            &self.root,
            Arc::new(ChangeSignal::new()),
            ignore,
        );
        let tree = remote.scan(true).await.unwrap();
        tree.iter().map(|i| i.path.to_string()).collect()
    }
}

fn set_mtime(path: &Path, time: SystemTime) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

#[tokio::test]
async fn test_first_cycle_uploads_and_second_converges() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("a.txt", b"alpha");
    f.write("sub/b.txt", b"beta");
    let pair = f.open().await;

    let first = pair.run_cycle(true).await.unwrap();
    assert_eq!(first.computed, 3);
    assert_eq!(first.done, 3);
    assert!(first.is_clean());

    let second = pair.run_cycle(true).await.unwrap();
    assert_eq!(second.computed, 0);

    assert_eq!(f.remote_paths().await, vec!["/a.txt", "/sub", "/sub/b.txt"]);
}

#[tokio::test]
async fn test_local_rename_keeps_remote_identity() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("dir/old.txt", b"content");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();
    let id = pair.state().await.remote.get(&p("/dir/old.txt")).unwrap().id.clone();

    fs::rename(f.root.join("dir/old.txt"), f.root.join("dir/new.txt")).unwrap();
    pair.signal().touch();

    let deltas = pair.plan(false).await.unwrap();
    assert_eq!(
        deltas,
        vec![Delta::RenameRemoteFile {
            from: p("/dir/old.txt"),
            to: p("/dir/new.txt"),
        }]
    );

    let report = pair.run_cycle(false).await.unwrap();
    assert_eq!(report.done, 1);
    let state = pair.state().await;
    assert_eq!(state.remote.get(&p("/dir/new.txt")).unwrap().id, id);
    assert!(state.hashes.contains_key(&p("/dir/new.txt")));
    assert!(!state.hashes.contains_key(&p("/dir/old.txt")));

    assert_eq!(pair.run_cycle(true).await.unwrap().computed, 0);
}

#[tokio::test]
async fn test_local_directory_move_is_one_delta() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("a/inner/x.txt", b"x");
    fs::create_dir_all(f.root.join("b")).unwrap();
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    fs::rename(f.root.join("a/inner"), f.root.join("b/inner")).unwrap();
    pair.signal().touch();

    let report = pair.run_cycle(false).await.unwrap();
    assert_eq!(report.computed, 1);
    assert!(report.is_clean());
    assert_eq!(
        f.remote_paths().await,
        vec!["/a", "/b", "/b/inner", "/b/inner/x.txt"]
    );
}

#[tokio::test]
async fn test_file_moved_out_of_renamed_directory() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("a/x", b"x");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    fs::rename(f.root.join("a/x"), f.root.join("x")).unwrap();
    fs::rename(f.root.join("a"), f.root.join("c")).unwrap();
    pair.signal().touch();

    let report = pair.run_cycle(false).await.unwrap();
    assert_eq!(report.computed, 2);
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(f.remote_paths().await, vec!["/c", "/x"]);

    assert_eq!(pair.run_cycle(true).await.unwrap().computed, 0);
    assert_eq!(f.remote_paths().await, vec!["/c", "/x"]);
}

#[tokio::test]
async fn test_child_renamed_inside_renamed_directory() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("a/x", b"x");
    f.write("a/keep", b"k");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    fs::rename(f.root.join("a"), f.root.join("b")).unwrap();
    fs::rename(f.root.join("b/x"), f.root.join("b/y")).unwrap();
    pair.signal().touch();

    let report = pair.run_cycle(false).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(f.remote_paths().await, vec!["/b", "/b/keep", "/b/y"]);
    assert_eq!(pair.run_cycle(true).await.unwrap().computed, 0);
}

#[tokio::test]
async fn test_swapped_names_keep_their_content() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("a.txt", b"A");
    f.write("b.txt", b"B");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();
    let old_b = pair.state().await.remote.get(&p("/b.txt")).unwrap().id.clone();

    fs::rename(f.root.join("a.txt"), f.root.join("swap")).unwrap();
    fs::rename(f.root.join("b.txt"), f.root.join("a.txt")).unwrap();
    fs::rename(f.root.join("swap"), f.root.join("b.txt")).unwrap();
    pair.signal().touch();

    let report = pair.run_cycle(false).await.unwrap();
    assert_eq!(report.computed, 2);
    assert!(report.is_clean(), "{:?}", report.failures);

    let state = pair.state().await;
    let now_a = &state.remote.get(&p("/a.txt")).unwrap().id;
    assert_eq!(now_a, &old_b);
    assert_eq!(f.store.download(now_a).await.unwrap(), b"B");
    assert_eq!(f.remote_paths().await, vec!["/a.txt", "/b.txt"]);

    assert_eq!(pair.run_cycle(true).await.unwrap().computed, 0);
}

#[tokio::test]
async fn test_rename_of_locally_deleted_file_is_not_retried_forever() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("old.txt", b"keep me");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    let id = pair.state().await.remote.get(&p("/old.txt")).unwrap().id.clone();
    f.store.rename(&id, "new.txt").await.unwrap();
    fs::remove_file(f.root.join("old.txt")).unwrap();
    pair.signal().touch();

    let second = pair.run_cycle(true).await.unwrap();
    assert_eq!(second.failures.len(), 1);

    // The rename on the remote side wins: the file comes back under its
    // new name instead of the same rename failing again.
    let third = pair.run_cycle(true).await.unwrap();
    assert!(third.is_clean(), "{:?}", third.failures);
    assert_eq!(third.done, 1);
    assert_eq!(f.read("new.txt"), b"keep me");

    assert_eq!(pair.run_cycle(true).await.unwrap().computed, 0);
}

#[tokio::test]
async fn test_remote_addition_is_downloaded() {
    let f = Fixture::new(SyncMode::TwoWay);
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    let root_id = f.remote_root().await;
    let folder = f.store.create_dir(&root_id, "shared").await.unwrap();
    f.store
        .upload(&folder.id, "note.md", b"from the cloud".to_vec(), 1_700_000_000_000)
        .await
        .unwrap();

    let report = pair.run_cycle(true).await.unwrap();
    assert_eq!(report.done, 2);
    assert_eq!(f.read("shared/note.md"), b"from the cloud");

    let modified = fs::metadata(f.root.join("shared/note.md"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(
        modified,
        SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_000)
    );
    assert!(!f.root.join(".vaultsync.tmp").read_dir().unwrap().any(|_| true));

    assert_eq!(pair.run_cycle(true).await.unwrap().computed, 0);
}

#[tokio::test]
async fn test_local_delete_trashes_remote() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("keep.txt", b"k");
    f.write("gone/one.txt", b"1");
    f.write("gone/two.txt", b"2");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    fs::remove_dir_all(f.root.join("gone")).unwrap();
    pair.signal().touch();

    let deltas = pair.plan(false).await.unwrap();
    assert_eq!(deltas, vec![Delta::DeleteRemoteDirectory { path: p("/gone") }]);

    pair.run_cycle(false).await.unwrap();
    assert_eq!(f.remote_paths().await, vec!["/keep.txt"]);
    assert!(pair.state().await.hashes.keys().all(|k| !k.starts_with(&p("/gone"))));
}

#[tokio::test]
async fn test_remote_delete_moves_local_to_trash() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("doomed.txt", b"bye");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    let id = pair.state().await.remote.get(&p("/doomed.txt")).unwrap().id.clone();
    f.store.trash(&id).await.unwrap();

    pair.run_cycle(true).await.unwrap();
    assert!(!f.root.join("doomed.txt").exists());

    let trash = f.root.join(LOCAL_TRASH_DIR);
    let bins: Vec<PathBuf> = fs::read_dir(&trash)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(bins.len(), 1);
    assert_eq!(fs::read(bins[0].join("doomed.txt")).unwrap(), b"bye");
}

#[tokio::test]
async fn test_touched_but_unchanged_file_is_not_uploaded() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("same.txt", b"unchanged");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    set_mtime(
        &f.root.join("same.txt"),
        SystemTime::now() + Duration::from_secs(60),
    );
    pair.signal().touch();
    assert!(pair.plan(false).await.unwrap().is_empty());

    f.write("same.txt", b"changed!");
    set_mtime(
        &f.root.join("same.txt"),
        SystemTime::now() + Duration::from_secs(120),
    );
    pair.signal().touch();
    assert_eq!(
        pair.plan(false).await.unwrap(),
        vec![Delta::UploadFile { path: p("/same.txt") }]
    );

    pair.run_cycle(false).await.unwrap();
    let id = pair.state().await.remote.get(&p("/same.txt")).unwrap().id.clone();
    assert_eq!(f.store.download(&id).await.unwrap(), b"changed!");
}

#[tokio::test]
async fn test_state_survives_restart() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("a.txt", b"a");
    {
        let pair = f.open().await;
        pair.run_cycle(true).await.unwrap();
    }

    // Renamed while no pair was running.
    fs::rename(f.root.join("a.txt"), f.root.join("b.txt")).unwrap();

    let pair = f.open().await;
    assert_eq!(pair.state().await.local.len(), 1);
    assert_eq!(
        pair.plan(true).await.unwrap(),
        vec![Delta::RenameRemoteFile {
            from: p("/a.txt"),
            to: p("/b.txt"),
        }]
    );
}

#[tokio::test]
async fn test_backup_mode_never_deletes_remotely() {
    let f = Fixture::new(SyncMode::LocalBackup);
    f.write("photo.jpg", b"pixels");
    let pair = f.open().await;
    pair.run_cycle(true).await.unwrap();

    fs::remove_file(f.root.join("photo.jpg")).unwrap();
    pair.signal().touch();

    let report = pair.run_cycle(false).await.unwrap();
    assert_eq!(report.computed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(f.remote_paths().await, vec!["/photo.jpg"]);

    // The missing file is not pulled back either.
    assert_eq!(pair.run_cycle(true).await.unwrap().done, 0);
    assert!(!f.root.join("photo.jpg").exists());
}

#[tokio::test]
async fn test_ignored_files_stay_local() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write(".vaultsyncignore", b"# build output\ntarget\n*.log\n");
    f.write("target/debug/app", b"bin");
    f.write("run.log", b"log");
    f.write("src/main.rs", b"fn main() {}");
    let pair = f.open().await;

    pair.run_cycle(true).await.unwrap();

    assert_eq!(f.remote_paths().await, vec!["/src", "/src/main.rs"]);
}

#[tokio::test]
async fn test_remote_type_clash_is_left_alone() {
    let f = Fixture::new(SyncMode::TwoWay);
    f.write("clash", b"file here");
    let root_id = f.remote_root_or_create().await;
    f.store.create_dir(&root_id, "clash").await.unwrap();
    let pair = f.open().await;

    let report = pair.run_cycle(true).await.unwrap();
    assert_eq!(report.computed, 0);
    assert_eq!(
        report.clashes,
        vec![TypeClash {
            path: p("/clash"),
            local: ItemKind::File,
            remote: ItemKind::Directory,
        }]
    );
    let state = pair.state().await;
    assert_eq!(state.remote.get(&p("/clash")).unwrap().kind, ItemKind::Directory);
    assert_eq!(f.read("clash"), b"file here");
}
