//! End-to-end embedding: import, batch embedding, incremental re-embedding
//! after content edits, and failure isolation.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{open_mesh, write_note, TopicModel};
use tempfile::TempDir;

async fn import_all(mesh: &notemesh::NoteMesh, paths: &[&str]) {
    let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
    mesh.scan(&paths).await.unwrap();
    mesh.import().await.unwrap();
}

#[tokio::test]
async fn embed_pending_covers_sources_and_blocks() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nalpha alpha\n# Two\nbeta beta\n", 100);

    let model = Arc::new(TopicModel::new());
    let mesh = open_mesh(vault.path(), model.clone()).await;
    mesh.load().await.unwrap();
    import_all(&mesh, &["a.md"]).await;

    // Source plus two blocks.
    assert_eq!(mesh.embed_pending().await.unwrap(), 3);
    // Everything is embedded now, the next pass is a no-op.
    assert_eq!(mesh.embed_pending().await.unwrap(), 0);

    // Vectors match the deterministic model output for the breadcrumbed
    // inputs.
    let hits = mesh.nearest(&TopicModel::vec_for("alpha"), &notemesh::QueryFilter::default());
    assert_eq!(hits.first().map(|c| c.key.as_str()), Some("a.md#One"));
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn unchanged_blocks_keep_vectors_across_edits() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nalpha\n# Two\nbeta\n", 100);

    let model = Arc::new(TopicModel::new());
    let mesh = open_mesh(vault.path(), model.clone()).await;
    mesh.load().await.unwrap();
    import_all(&mesh, &["a.md"]).await;
    mesh.embed_pending().await.unwrap();
    let calls_after_first = model.calls.load(Ordering::SeqCst);

    // Append a third section; the first two blocks keep their lengths.
    write_note(
        vault.path(),
        "a.md",
        "# One\nalpha\n# Two\nbeta\n# Three\ngamma\n",
        200,
    );
    import_all(&mesh, &["a.md"]).await;

    // Only the source and the new block re-embed.
    assert_eq!(mesh.embed_pending().await.unwrap(), 2);
    assert!(model.calls.load(Ordering::SeqCst) > calls_after_first);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn changed_block_length_clears_and_reembeds() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nalpha\n", 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    import_all(&mesh, &["a.md"]).await;
    mesh.embed_pending().await.unwrap();

    write_note(vault.path(), "a.md", "# One\nalpha alpha alpha\n", 200);
    import_all(&mesh, &["a.md"]).await;
    // Source and the grown block.
    assert_eq!(mesh.embed_pending().await.unwrap(), 2);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn failed_inputs_get_error_markers_not_retries() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# Good\nalpha\n# Bad\nPOISON text\n", 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::failing_on("POISON"))).await;
    mesh.load().await.unwrap();
    import_all(&mesh, &["a.md"]).await;

    // The poisoned batch falls back to per-item calls; the good block and
    // the source still land (the source input contains the poisoned body,
    // so only the good block embeds).
    mesh.embed_pending().await.unwrap();
    let good = mesh.nearest(&TopicModel::vec_for("alpha"), &notemesh::QueryFilter::default());
    assert!(good.iter().any(|c| c.key == "a.md#Good"));
    assert!(good.iter().all(|c| c.key != "a.md#Bad"));

    // Error markers keep failed items out of the queue.
    assert_eq!(mesh.embed_pending().await.unwrap(), 0);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn pause_stops_at_batch_boundary() {
    let vault = TempDir::new().unwrap();
    // Enough sections for several batches at batch_size 3.
    let mut content = String::new();
    for i in 0..9 {
        content.push_str(&format!("# Section{i}\nalpha body {i}\n"));
    }
    write_note(vault.path(), "a.md", &content, 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    import_all(&mesh, &["a.md"]).await;

    mesh.pause_embedding();
    assert_eq!(mesh.embed_pending().await.unwrap(), 0);

    mesh.resume_embedding();
    // 9 blocks + 1 source.
    assert_eq!(mesh.embed_pending().await.unwrap(), 10);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn flush_waits_for_the_debounce_window() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nalpha\n", 100);

    // open_mesh configures a 50ms debounce.
    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    import_all(&mesh, &["a.md"]).await;

    assert_eq!(mesh.flush_if_due().await.unwrap(), 0);
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    assert!(mesh.flush_if_due().await.unwrap() > 0);
    // The queue drained; nothing left to write.
    assert_eq!(mesh.flush_if_due().await.unwrap(), 0);
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn excluded_headings_produce_no_blocks() {
    let vault = TempDir::new().unwrap();
    write_note(
        vault.path(),
        "a.md",
        "# Keep\nalpha\n# Secrets\nhidden text\n",
        100,
    );

    let mut config = notemesh::Config::new(".notemesh/multi");
    config.min_chars = 1;
    config.excluded_headings = vec!["Secrets".to_string()];
    let mesh = notemesh::NoteMesh::open(
        vault.path(),
        config,
        Arc::new(common::HeadingChunker),
        notemesh::ModelContext::new(Arc::new(TopicModel::new())),
        Arc::new(notemesh::NullNotices),
    )
    .await
    .unwrap();
    mesh.load().await.unwrap();
    import_all(&mesh, &["a.md"]).await;

    let pending = mesh.embed_pending().await.unwrap();
    // Source plus the one kept block.
    assert_eq!(pending, 2);
    let hits = mesh.nearest(&[0.0, 0.0, 0.0, 0.0, 1.0], &notemesh::QueryFilter::default());
    assert!(hits.iter().all(|c| c.key != "a.md#Secrets"));
    mesh.close().await.unwrap();
}

#[tokio::test]
async fn vectors_survive_reopen() {
    let vault = TempDir::new().unwrap();
    write_note(vault.path(), "a.md", "# One\nalpha\n", 100);

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    import_all(&mesh, &["a.md"]).await;
    mesh.embed_pending().await.unwrap();
    mesh.close().await.unwrap();

    let mesh = open_mesh(vault.path(), Arc::new(TopicModel::new())).await;
    mesh.load().await.unwrap();
    assert_eq!(mesh.embed_pending().await.unwrap(), 0);
    let hits = mesh.nearest(&TopicModel::vec_for("alpha"), &notemesh::QueryFilter::default());
    assert!(!hits.is_empty());
    mesh.close().await.unwrap();
}
