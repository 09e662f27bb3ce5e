//! Load-time reconciliation: fragment folding, orphan cleanup, compaction,
//! and round-tripping the store through flush and reopen.

mod common;

use std::sync::Arc;

use common::{open_mesh, write_note, TopicModel};
use notemesh::{Chunker, StorageBackend};
use tempfile::TempDir;

fn data_file(vault: &TempDir, name: &str) -> std::path::PathBuf {
    vault.path().join(".notemesh/multi").join(name)
}

#[tokio::test]
async fn load_folds_fragments_last_write_wins() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nalpha body\n", 100);
    std::fs::create_dir_all(vault.path().join(".notemesh/multi")).unwrap();
    std::fs::write(
        data_file(&vault, "a.jsonl"),
        concat!(
            "{\"a.md\": {\"path\": \"a.md\", \"history\": [{\"hash\": \"h1\", \"mtime\": 1, \"size\": 5, \"blocks\": [\"a.md#One\"]}]}}\n",
            "{\"a.md#One\": {\"path\": \"a.md#One\", \"lines\": [0, 1], \"length\": 9}}\n",
            "{\"a.md#One\": null}\n",
            "{\"a.md#One\": {\"path\": \"a.md#One\", \"lines\": [0, 1], \"length\": 11}}\n",
        ),
    )
    .unwrap();

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    let report = mesh.load().await.unwrap();

    assert_eq!(report.sources, 1);
    assert_eq!(report.blocks, 1);
    assert_eq!(report.skipped_lines, 0);
    assert_eq!(mesh.len(), 2);

    // The folded file was rewritten in canonical form; a second load over
    // a fresh handle sees the same state without another rewrite.
    let compacted = std::fs::read_to_string(data_file(&vault, "a.jsonl")).unwrap();
    assert_eq!(compacted.lines().count(), 2);
    assert!(compacted.contains("\"length\":11"));
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn load_drops_orphaned_logs() {
    let vault = TempDir::new().unwrap();
    std::fs::create_dir_all(vault.path().join(".notemesh/multi")).unwrap();
    std::fs::write(
        data_file(&vault, "gone.jsonl"),
        "{\"gone.md\": {\"path\": \"gone.md\"}}\n",
    )
    .unwrap();

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    let report = mesh.load().await.unwrap();

    assert_eq!(report.orphans, 1);
    assert_eq!(mesh.len(), 0);
    assert!(!data_file(&vault, "gone.jsonl").exists());
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn load_skips_malformed_lines_and_compacts_them_away() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nbody\n", 100);
    std::fs::create_dir_all(vault.path().join(".notemesh/multi")).unwrap();
    std::fs::write(
        data_file(&vault, "a.jsonl"),
        "{\"a.md\": {\"path\": \"a.md\"}}\nGARBAGE LINE\n",
    )
    .unwrap();

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    let report = mesh.load().await.unwrap();

    assert_eq!(report.skipped_lines, 1);
    assert_eq!(report.sources, 1);
    let rewritten = std::fs::read_to_string(data_file(&vault, "a.jsonl")).unwrap();
    assert!(!rewritten.contains("GARBAGE"));
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn import_flush_reopen_roundtrip() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "notes/a.md", "# One\nalpha alpha\n# Two\nbeta\n", 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    let scan = mesh.scan(&["notes/a.md".to_string()]).await.unwrap();
    assert_eq!(scan.queued, 1);
    assert_eq!(mesh.import().await.unwrap(), 1);
    assert!(mesh.flush().await.unwrap() > 0);
    mesh.close().await.unwrap();

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    let report = mesh.load().await.unwrap();
    assert_eq!(report.sources, 1);
    assert_eq!(report.blocks, 2);
    assert!(mesh.inbound_links("notes/a.md").is_empty());

    // Rescanning the unchanged vault queues nothing.
    let scan = mesh.scan(&["notes/a.md".to_string()]).await.unwrap();
    assert_eq!(scan.queued, 0);
    assert_eq!(scan.unchanged, 0);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn deleted_file_removes_its_log() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nbody text\n", 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    mesh.scan(&["a.md".to_string()]).await.unwrap();
    mesh.import().await.unwrap();
    mesh.flush().await.unwrap();
    assert!(data_file(&vault, "a.jsonl").exists());

    std::fs::remove_file(vault.path().join("a.md")).unwrap();
    let scan = mesh.scan(&["a.md".to_string()]).await.unwrap();
    assert_eq!(scan.tombstoned, 1);
    mesh.flush().await.unwrap();

    assert!(!data_file(&vault, "a.jsonl").exists());
    assert_eq!(mesh.len(), 0);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn metadata_noise_refreshes_stat_without_reimport() {
    let vault = TempDir::new().unwrap();
    let content = "# One\nstable body\n";
    write_note(vault.path(), "a.md", content, 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    mesh.scan(&["a.md".to_string()]).await.unwrap();
    mesh.import().await.unwrap();
    mesh.flush().await.unwrap();

    // Same bytes plus a newer mtime is metadata noise; the size tier
    // already answers, nothing is queued.
    write_note(vault.path(), "a.md", content, 200);
    let scan = mesh.scan(&["a.md".to_string()]).await.unwrap();
    assert_eq!(scan.queued, 0);
    assert_eq!(scan.unchanged, 0);

    // Grown by trailing whitespace: the size tier fires but the trimmed
    // content hash matches, so the stat refreshes without a re-import.
    let padded = format!("{content}{}", "\n".repeat(10));
    write_note(vault.path(), "a.md", &padded, 300);
    let scan = mesh.scan(&["a.md".to_string()]).await.unwrap();
    assert_eq!(scan.queued, 0);
    assert_eq!(scan.unchanged, 1);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn oversized_files_are_skipped() {
    let vault = TempDir::new().unwrap();
    let big = format!("# Big\n{}\n", "x".repeat(2_000_000));
    write_note(vault.path(), "big.md", &big, 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    let scan = mesh.scan(&["big.md".to_string()]).await.unwrap();
    assert_eq!(scan.skipped_large, 1);
    assert_eq!(scan.queued, 0);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn second_open_on_same_data_dir_fails() {
    let vault = TempDir::new().unwrap();
    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;

    let config = notemesh::Config::new(".notemesh/multi");
    let second = notemesh::NoteMesh::open(
        vault.path(),
        config,
        Arc::new(common::HeadingChunker),
        notemesh::ModelContext::new(Arc::new(TopicModel::new())),
        Arc::new(notemesh::NullNotices),
    )
    .await;
    assert!(matches!(
        second,
        Err(notemesh::NoteMeshError::Lock(_))
    ));
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn partial_rescan_leaves_unlisted_sources_alone() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nalpha body\n", 100);
    write_note(vault.path(), "b.md", "# Two\nbeta body\n", 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    mesh.scan(&["a.md".to_string(), "b.md".to_string()])
        .await
        .unwrap();
    mesh.import().await.unwrap();
    mesh.flush().await.unwrap();
    let before = mesh.len();

    // Rescanning one file must not touch the other source.
    write_note(vault.path(), "a.md", "# One\nalpha alpha grown\n", 200);
    let scan = mesh.scan(&["a.md".to_string()]).await.unwrap();
    assert_eq!(scan.queued, 1);
    assert_eq!(scan.tombstoned, 0);
    mesh.import().await.unwrap();
    mesh.flush().await.unwrap();

    assert_eq!(mesh.len(), before);
    assert!(data_file(&vault, "b.jsonl").exists());
    mesh.close().await.unwrap();
}

/// Delegating backend whose writes fail while the fuse counter is lit.
struct FlakyWrites {
    inner: notemesh::LocalFs,
    append_failures: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl notemesh::StorageBackend for FlakyWrites {
    async fn exists(&self, path: &std::path::Path) -> bool {
        self.inner.exists(path).await
    }
    async fn read(&self, path: &std::path::Path) -> notemesh::Result<String> {
        self.inner.read(path).await
    }
    async fn write(&self, path: &std::path::Path, content: &str) -> notemesh::Result<()> {
        self.inner.write(path, content).await
    }
    async fn append(&self, path: &std::path::Path, content: &str) -> notemesh::Result<()> {
        use std::sync::atomic::Ordering;
        if self.append_failures.load(Ordering::SeqCst) > 0 {
            self.append_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
        }
        self.inner.append(path, content).await
    }
    async fn list(&self, dir: &std::path::Path) -> notemesh::Result<Vec<std::path::PathBuf>> {
        self.inner.list(dir).await
    }
    async fn remove(&self, path: &std::path::Path) -> notemesh::Result<()> {
        self.inner.remove(path).await
    }
    async fn mkdir(&self, path: &std::path::Path) -> notemesh::Result<()> {
        self.inner.mkdir(path).await
    }
    async fn stat(&self, path: &std::path::Path) -> notemesh::Result<notemesh::FileStat> {
        self.inner.stat(path).await
    }
}

#[tokio::test]
async fn flush_failure_requeues_every_group() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nalpha body\n", 100);
    write_note(vault.path(), "b.md", "# Two\nbeta body\n", 100);

    // Enough failures to sink both sources' appends in the first flush.
    let backend = Arc::new(FlakyWrites {
        inner: notemesh::LocalFs::new(vault.path()),
        append_failures: std::sync::atomic::AtomicUsize::new(2),
    });
    let mut config = notemesh::Config::new(".notemesh/multi");
    config.min_chars = 1;
    let mesh = notemesh::NoteMesh::open_with_backend(
        backend,
        config,
        Arc::new(common::HeadingChunker),
        notemesh::ModelContext::new(Arc::new(TopicModel::new())),
        Arc::new(notemesh::NullNotices),
    )
    .await
    .unwrap();
    mesh.load().await.unwrap();
    mesh.scan(&["a.md".to_string(), "b.md".to_string()])
        .await
        .unwrap();
    mesh.import().await.unwrap();

    assert!(mesh.flush().await.is_err());

    // Every failed group was re-queued, so the healed backend persists
    // both logs on the next flush and the queue drains completely.
    assert!(mesh.flush().await.unwrap() > 0);
    assert_eq!(mesh.flush().await.unwrap(), 0);
    assert!(data_file(&vault, "a.jsonl").exists());
    assert!(data_file(&vault, "b.jsonl").exists());
    mesh.close().await.unwrap();
}

/// Chunker that refuses content carrying a poison marker.
struct PickyChunker;

impl notemesh::Chunker for PickyChunker {
    fn parse(&self, path: &str, content: &str) -> notemesh::Result<notemesh::ParsedDoc> {
        if content.contains("%%broken%%") {
            return Err(notemesh::NoteMeshError::parse(path, "unreadable section"));
        }
        common::HeadingChunker.parse(path, content)
    }
}

#[tokio::test]
async fn import_continues_past_a_failing_parse() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "bad.md", "# Bad\n%%broken%% body\n", 100);
    write_note(vault.path(), "good.md", "# Good\nalpha body\n", 100);

    let mut config = notemesh::Config::new(".notemesh/multi");
    config.min_chars = 1;
    let mesh = notemesh::NoteMesh::open(
        vault.path(),
        config,
        Arc::new(PickyChunker),
        notemesh::ModelContext::new(Arc::new(TopicModel::new())),
        Arc::new(notemesh::NullNotices),
    )
    .await
    .unwrap();
    mesh.load().await.unwrap();
    mesh.scan(&["bad.md".to_string(), "good.md".to_string()])
        .await
        .unwrap();

    // The failing source stays queued; the good one imports this cycle.
    assert_eq!(mesh.import().await.unwrap(), 1);
    assert_eq!(mesh.import().await.unwrap(), 0);

    // Once the content mends, the still-queued source imports without a
    // rescan.
    write_note(vault.path(), "bad.md", "# Bad\nmended body\n", 200);
    assert_eq!(mesh.import().await.unwrap(), 1);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn load_drops_corrupt_records_and_continues() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nbody\n", 100);
    write_note(vault.path(), "b.md", "# Two\nbody\n", 100);
    std::fs::create_dir_all(vault.path().join(".notemesh/multi")).unwrap();
    std::fs::write(
        data_file(&vault, "a.jsonl"),
        concat!(
            "{\"a.md\": {\"path\": \"a.md\"}}\n",
            "{\"a.md#One\": {\"path\": \"a.md#One\", \"lines\": \"nope\", \"length\": 4}}\n",
        ),
    )
    .unwrap();
    std::fs::write(
        data_file(&vault, "b.jsonl"),
        "{\"b.md\": {\"path\": \"b.md\"}}\n",
    )
    .unwrap();

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    let report = mesh.load().await.unwrap();

    // The wrong-shaped block record is dropped; both sources, including
    // the one sharing a log with it, still materialize.
    assert_eq!(report.corrupt, 1);
    assert_eq!(report.sources, 2);
    assert_eq!(report.blocks, 0);
    assert_eq!(mesh.len(), 2);
    mesh.close().await.unwrap();
}
