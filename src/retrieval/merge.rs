//! Candidate post-processing: dedup, context merge, and small-document packing.
//!
//! These steps are pure functions over the candidate list so the whole pipeline is
//! deterministic and directly testable: the same input always yields byte-identical output.

use std::collections::HashMap;

use serde::Deserialize;

/// Separator placed between merged chunk bodies.
pub const CONTENT_SEPARATOR: &str = "\n\n---\n\n";

/// A candidate chunk as it comes out of the corpus store.
#[derive(Debug, Clone)]
pub struct RawChunk {
    /// Stable chunk identifier.
    pub id: String,
    /// Source URL.
    pub url: String,
    /// Raw body; possibly a structured envelope.
    pub content: String,
}

/// A retrieval unit produced by merging one or more chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedResult {
    /// Primary identifier (the first merged chunk's id).
    pub id: String,
    /// Representative URL (the first merged chunk's URL).
    pub url: String,
    /// Context label; empty when the source chunks carried none.
    pub context: String,
    /// Merged content.
    pub content: String,
    /// Identifiers of every chunk merged into this result.
    pub merged_from: Vec<String>,
}

impl ProcessedResult {
    /// Whether more than one source chunk contributed.
    pub fn is_merged(&self) -> bool {
        self.merged_from.len() > 1
    }
}

#[derive(Deserialize)]
struct Envelope {
    context: String,
    content: String,
}

/// Split a chunk body into `(context label, inner content)`.
///
/// Bodies that are not a `{"context": .., "content": ..}` JSON object pass through with an
/// empty label.
fn parse_envelope(raw: &str) -> (String, String) {
    match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) => (envelope.context, envelope.content),
        Err(_) => (String::new(), raw.to_string()),
    }
}

/// Drop duplicate chunk ids, preserving first-seen order.
pub fn dedup_chunks(chunks: Vec<RawChunk>) -> Vec<RawChunk> {
    let mut seen = HashMap::new();
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if seen.insert(chunk.id.clone(), ()).is_none() {
            out.push(chunk);
        }
    }
    out
}

/// Group chunks by context label and merge each group into one result.
///
/// Chunks without a label stay standalone: merging them would collapse unrelated documents,
/// since only a shared label guarantees a shared URL. Group order follows the first
/// occurrence of each label.
pub fn merge_by_context(chunks: Vec<RawChunk>) -> Vec<ProcessedResult> {
    let mut results: Vec<ProcessedResult> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();

    for chunk in chunks {
        let (context, inner) = parse_envelope(&chunk.content);
        if context.is_empty() {
            results.push(ProcessedResult {
                id: chunk.id.clone(),
                url: chunk.url,
                context,
                content: inner,
                merged_from: vec![chunk.id],
            });
            continue;
        }

        match group_index.get(&context) {
            Some(&index) => {
                let group = &mut results[index];
                group.content.push_str(CONTENT_SEPARATOR);
                group.content.push_str(&inner);
                group.merged_from.push(chunk.id);
            }
            None => {
                group_index.insert(context.clone(), results.len());
                results.push(ProcessedResult {
                    id: chunk.id.clone(),
                    url: chunk.url,
                    context,
                    content: inner,
                    merged_from: vec![chunk.id],
                });
            }
        }
    }

    results
}

/// Pack short results into batches so the reranker sees fewer, denser documents.
///
/// Results at or above `threshold` pass through untouched. The short ones are sorted
/// ascending by length and packed greedily; a new batch starts whenever the next element
/// would push the batch total past `threshold`. Single-member batches pass through
/// unchanged, multi-member batches become one merged result.
pub fn merge_small_documents(
    results: Vec<ProcessedResult>,
    threshold: usize,
) -> Vec<ProcessedResult> {
    let mut large = Vec::new();
    let mut small = Vec::new();
    for result in results {
        if result.content.len() >= threshold {
            large.push(result);
        } else {
            small.push(result);
        }
    }
    small.sort_by_key(|result| result.content.len());

    let mut batches: Vec<Vec<ProcessedResult>> = Vec::new();
    let mut batch: Vec<ProcessedResult> = Vec::new();
    let mut batch_len = 0usize;
    for result in small {
        if !batch.is_empty() && batch_len + result.content.len() > threshold {
            batches.push(std::mem::take(&mut batch));
            batch_len = 0;
        }
        batch_len += result.content.len();
        batch.push(result);
    }
    if !batch.is_empty() {
        batches.push(batch);
    }

    for batch in batches {
        large.push(merge_batch(batch));
    }
    large
}

fn merge_batch(mut batch: Vec<ProcessedResult>) -> ProcessedResult {
    if batch.len() == 1 {
        return batch.remove(0);
    }

    let labels: Vec<&str> = batch
        .iter()
        .map(|result| result.context.as_str())
        .filter(|label| !label.is_empty())
        .collect();
    let context = format!("Merged: {}", labels.join(" | "));
    let content = batch
        .iter()
        .map(|result| result.content.as_str())
        .collect::<Vec<_>>()
        .join(CONTENT_SEPARATOR);
    let merged_from = batch
        .iter()
        .flat_map(|result| result.merged_from.iter().cloned())
        .collect();

    ProcessedResult {
        id: batch[0].id.clone(),
        url: batch[0].url.clone(),
        context,
        content,
        merged_from,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, url: &str, content: &str) -> RawChunk {
        RawChunk {
            id: id.into(),
            url: url.into(),
            content: content.into(),
        }
    }

    fn envelope(context: &str, content: &str) -> String {
        serde_json::json!({ "context": context, "content": content }).to_string()
    }

    fn plain(id: &str, content: &str) -> ProcessedResult {
        ProcessedResult {
            id: id.into(),
            url: format!("https://example.org/{id}"),
            context: String::new(),
            content: content.into(),
            merged_from: vec![id.into()],
        }
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let chunks = vec![
            chunk("a", "u1", "one"),
            chunk("b", "u2", "two"),
            chunk("a", "u1", "one again"),
            chunk("c", "u3", "three"),
        ];
        let deduped = dedup_chunks(chunks);
        let ids: Vec<&str> = deduped.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(deduped[0].content, "one");
    }

    #[test]
    fn context_merge_groups_labeled_chunks() {
        let chunks = vec![
            chunk("a", "https://d.example/swiftui", &envelope("SwiftUI", "part one")),
            chunk("b", "https://d.example/uikit", &envelope("UIKit", "other doc")),
            chunk("c", "https://d.example/swiftui", &envelope("SwiftUI", "part two")),
        ];
        let merged = merge_by_context(chunks);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].context, "SwiftUI");
        assert_eq!(merged[0].url, "https://d.example/swiftui");
        assert_eq!(
            merged[0].content,
            format!("part one{CONTENT_SEPARATOR}part two")
        );
        assert_eq!(merged[0].merged_from, vec!["a".to_string(), "c".to_string()]);
        assert!(merged[0].is_merged());
        assert!(!merged[1].is_merged());
    }

    #[test]
    fn context_merge_keeps_first_url_for_the_group() {
        // The corpus invariant says same label implies same URL; when it is violated the
        // first chunk's URL is authoritative.
        let chunks = vec![
            chunk("a", "https://d.example/one", &envelope("Label", "x")),
            chunk("b", "https://d.example/two", &envelope("Label", "y")),
        ];
        let merged = merge_by_context(chunks);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].url, "https://d.example/one");
    }

    #[test]
    fn unlabeled_chunks_stay_standalone() {
        let chunks = vec![
            chunk("a", "u1", "plain text one"),
            chunk("b", "u2", "plain text two"),
        ];
        let merged = merge_by_context(chunks);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|result| result.context.is_empty()));
    }

    #[test]
    fn non_envelope_json_passes_through_as_content() {
        let chunks = vec![chunk("a", "u1", r#"{"unrelated": true}"#)];
        let merged = merge_by_context(chunks);
        assert_eq!(merged[0].content, r#"{"unrelated": true}"#);
        assert!(merged[0].context.is_empty());
    }

    #[test]
    fn small_merge_packs_ascending_until_threshold() {
        let results = vec![
            plain("big", &"x".repeat(1600)),
            plain("s1", &"a".repeat(700)),
            plain("s2", &"b".repeat(400)),
            plain("s3", &"c".repeat(900)),
        ];
        let merged = merge_small_documents(results, 1500);
        // Large first, then batches: [400 + 700], [900].
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, "big");
        assert_eq!(merged[1].merged_from, vec!["s2".to_string(), "s1".to_string()]);
        assert_eq!(merged[1].url, "https://example.org/s2");
        assert_eq!(merged[2].id, "s3");
        assert_eq!(merged[2].context, "");
    }

    #[test]
    fn small_merge_labels_multi_member_batches() {
        let mut s1 = plain("s1", &"a".repeat(100));
        s1.context = "Intro".into();
        let mut s2 = plain("s2", &"b".repeat(200));
        s2.context = "Details".into();
        let merged = merge_small_documents(vec![s1, s2], 1500);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].context, "Merged: Intro | Details");
        assert_eq!(
            merged[0].content,
            format!("{}{CONTENT_SEPARATOR}{}", "a".repeat(100), "b".repeat(200))
        );
    }

    #[test]
    fn small_merge_leaves_singleton_batches_untouched() {
        let results = vec![plain("s1", &"a".repeat(1400))];
        let merged = merge_small_documents(results.clone(), 1500);
        assert_eq!(merged, results);
    }

    #[test]
    fn pipeline_is_deterministic() {
        let chunks = vec![
            chunk("a", "u1", &envelope("L1", &"x".repeat(300))),
            chunk("b", "u2", &"y".repeat(2000)),
            chunk("c", "u1", &envelope("L1", &"z".repeat(200))),
            chunk("d", "u3", &"w".repeat(100)),
        ];
        let run = |input: Vec<RawChunk>| {
            merge_small_documents(merge_by_context(dedup_chunks(input)), 1500)
        };
        assert_eq!(run(chunks.clone()), run(chunks));
    }
}
