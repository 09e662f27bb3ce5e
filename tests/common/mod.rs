//! Shared test fixtures: a heading-based chunker and a deterministic
//! embedding model with controllable geometry.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use notemesh::embed::EmbedOutput;
use notemesh::prelude::*;
use notemesh::types::LineSpan;

/// Splits markdown content into one block per heading, keyed by the
/// heading chain, and collects `[[wiki-link]]` outlinks.
pub struct HeadingChunker;

impl Chunker for HeadingChunker {
    fn parse(&self, path: &str, content: &str) -> Result<ParsedDoc> {
        let mut doc = ParsedDoc::default();
        let mut stack: Vec<(usize, String)> = Vec::new();
        let mut open: Option<(String, u32, String)> = None;

        let mut close = |doc: &mut ParsedDoc, open: &mut Option<(String, u32, String)>, end: u32| {
            if let Some((key, start, text)) = open.take() {
                let text = text.trim_end().to_string();
                doc.blocks.push(ParsedBlock {
                    path: key,
                    lines: LineSpan::new(start, end),
                    length: text.chars().count(),
                    text,
                });
            }
        };

        for (idx, line) in content.lines().enumerate() {
            let idx = idx as u32;
            let level = line.chars().take_while(|c| *c == '#').count();
            if level > 0 && line.chars().nth(level) == Some(' ') {
                close(&mut doc, &mut open, idx.saturating_sub(1));
                let heading = line[level + 1..].trim().to_string();
                stack.retain(|(l, _)| *l < level);
                stack.push((level, heading));
                let chain: Vec<&str> = stack.iter().map(|(_, h)| h.as_str()).collect();
                let key = format!("{path}#{}", chain.join("#"));
                open = Some((key, idx, String::new()));
            } else if let Some((_, _, text)) = open.as_mut() {
                text.push_str(line);
                text.push('\n');
            }
            for target in line.split("[[").skip(1) {
                if let Some(end) = target.find("]]") {
                    doc.outlinks.push(target[..end].to_string());
                }
            }
        }
        let last = content.lines().count().saturating_sub(1) as u32;
        close(&mut doc, &mut open, last);
        Ok(doc)
    }
}

/// Embeds by counting topic marker words, giving tests full control over
/// which inputs land near each other.
pub struct TopicModel {
    pub calls: AtomicUsize,
    fail_marker: Option<String>,
}

impl TopicModel {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_marker: None,
        }
    }

    /// A model that errors on any batch containing the marker.
    pub fn failing_on(marker: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_marker: Some(marker.to_string()),
        }
    }

    pub fn vec_for(text: &str) -> Vec<f32> {
        let topics = ["alpha", "beta", "gamma", "delta"];
        let mut v: Vec<f32> = topics
            .iter()
            .map(|t| text.matches(t).count() as f32)
            .collect();
        // Small bias keeps every vector off the origin.
        v.push(0.1);
        v
    }
}

#[async_trait]
impl EmbedModel for TopicModel {
    fn model_key(&self) -> &str {
        "topic-test-1"
    }
    fn dims(&self) -> usize {
        5
    }
    fn max_tokens(&self) -> u32 {
        512
    }
    fn batch_size(&self) -> usize {
        3
    }
    fn count_tokens(&self, text: &str) -> u32 {
        (text.chars().count() as u32).div_ceil(4)
    }
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<EmbedOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker {
            if inputs.iter().any(|i| i.contains(marker.as_str())) {
                return Err(NoteMeshError::model("marked input refused"));
            }
        }
        Ok(inputs
            .iter()
            .map(|i| EmbedOutput {
                vec: Self::vec_for(i),
                tokens: self.count_tokens(i),
            })
            .collect())
    }
}

/// Opens a mesh over `vault_root` with a tiny debounce so flush-timing
/// tests stay fast.
pub async fn open_mesh(vault_root: &std::path::Path, model: Arc<dyn EmbedModel>) -> NoteMesh {
    let mut config = Config::new(".notemesh/multi");
    config.min_chars = 1;
    config.save_debounce = std::time::Duration::from_millis(50);
    NoteMesh::open(
        vault_root,
        config,
        Arc::new(HeadingChunker),
        ModelContext::new(model),
        Arc::new(NullNotices),
    )
    .await
    .expect("open mesh")
}

/// Writes a vault file and stamps an explicit mtime so change detection
/// sees monotonic clocks regardless of test speed.
pub fn write_note(vault_root: &std::path::Path, rel: &str, content: &str, mtime_secs: u64) {
    let path = vault_root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_modified(std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime_secs))
        .unwrap();
}
