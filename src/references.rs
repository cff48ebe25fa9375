//! Citation markers and their resolution.
//!
//! Before generation, every context item handed to the model gets a marker
//! from one closed vocabulary: course chunks are `ref1..refK`, web snippets
//! continue at `refK+1`. After generation, [`resolve`] scans the answer for
//! markers and keeps only the cited candidates, in order of first appearance.
//! Markers outside the vocabulary stay in the text but are never turned into
//! references.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::models::{Reference, ReferenceTarget};
use crate::retriever::Candidate;
use crate::web_search::WebSnippet;

/// A reference plus the text shown to the model under its marker.
#[derive(Debug, Clone)]
pub struct CitableSource {
    pub reference: Reference,
    pub text: String,
}

fn marker_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[(ref\d+)\]").ok())
        .as_ref()
}

/// Assign markers to the sources a prompt will contain.
pub fn build_candidates(course: &[Candidate], web: &[WebSnippet]) -> Vec<CitableSource> {
    let mut out = Vec::with_capacity(course.len() + web.len());
    for c in course {
        out.push(CitableSource {
            reference: Reference {
                id: format!("ref{}", out.len() + 1),
                target: ReferenceTarget::Chunk {
                    doc_id: c.chunk.doc_id.clone(),
                    chunk_id: c.chunk.chunk_id.clone(),
                    page_or_slide: c.chunk.page_or_slide,
                    char_span: c.chunk.char_span,
                },
                source: c.source.clone(),
                title: c.chunk.title.clone(),
                score: c.score,
            },
            text: c.chunk.text.clone(),
        });
    }
    for w in web {
        out.push(CitableSource {
            reference: Reference {
                id: format!("ref{}", out.len() + 1),
                target: ReferenceTarget::Web { url: w.url.clone() },
                source: w.domain(),
                title: (!w.title.is_empty()).then(|| w.title.clone()),
                score: w.score,
            },
            text: w.snippet.clone(),
        });
    }
    out
}

/// Marker ids in `text`, in order of first appearance, without duplicates.
pub fn markers(text: &str) -> Vec<String> {
    let Some(re) = marker_pattern() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Keep the candidates the answer actually cites, ordered by first citation.
///
/// The answer text is returned unchanged; unknown markers are logged.
pub fn resolve(answer: &str, candidates: &[Reference]) -> (String, Vec<Reference>) {
    let mut resolved = Vec::new();
    for id in markers(answer) {
        match candidates.iter().find(|r| r.id == id) {
            Some(r) => resolved.push(r.clone()),
            None => warn!(marker = %id, "answer cites a marker that was not supplied"),
        }
    }
    (answer.to_string(), resolved)
}

/// Remove `[refN]` markers, used when replaying past answers as history.
pub fn strip_markers(text: &str) -> String {
    match marker_pattern() {
        Some(re) => re.replace_all(text, "").replace("  ", " "),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CharSpan, Chunk};

    fn chunk_ref(id: &str) -> Reference {
        Reference {
            id: id.to_string(),
            target: ReferenceTarget::Chunk {
                doc_id: "d".into(),
                chunk_id: format!("d-{id}"),
                page_or_slide: Some(1),
                char_span: CharSpan { start: 0, end: 1 },
            },
            source: "a.pdf".into(),
            title: None,
            score: 0.9,
        }
    }

    #[test]
    fn keeps_cited_references_in_citation_order() {
        let candidates = vec![chunk_ref("ref1"), chunk_ref("ref2"), chunk_ref("ref3")];
        let (text, refs) = resolve("X happens [ref1] and Y too [ref3]", &candidates);
        assert_eq!(text, "X happens [ref1] and Y too [ref3]");
        let ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["ref1", "ref3"]);
    }

    #[test]
    fn order_follows_first_appearance_not_rank() {
        let candidates = vec![chunk_ref("ref1"), chunk_ref("ref2")];
        let (_, refs) = resolve("B [ref2], A [ref1], B again [ref2]", &candidates);
        let ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["ref2", "ref1"]);
    }

    #[test]
    fn hallucinated_marker_stays_in_text_but_not_in_list() {
        let candidates = vec![chunk_ref("ref1")];
        let (text, refs) = resolve("Yes [ref7].", &candidates);
        assert_eq!(text, "Yes [ref7].");
        assert!(refs.is_empty());
    }

    #[test]
    fn no_markers_means_no_references() {
        let (_, refs) = resolve("Plain answer.", &[chunk_ref("ref1")]);
        assert!(refs.is_empty());
    }

    #[test]
    fn web_markers_continue_course_numbering() {
        let course = vec![Candidate {
            chunk: Chunk {
                chunk_id: "d-00000".into(),
                doc_id: "d".into(),
                seq: 0,
                text: "Heaps".into(),
                page_or_slide: Some(2),
                title: Some("Week 3".into()),
                char_span: CharSpan { start: 0, end: 5 },
                hash: String::new(),
            },
            score: 0.7,
            distance: 0.3,
            source: "week3.pdf".into(),
        }];
        let web = vec![WebSnippet {
            title: "Heap (data structure)".into(),
            url: "https://en.wikipedia.org/wiki/Heap_(data_structure)".into(),
            snippet: "A heap is a tree-based structure".into(),
            score: 0.5,
            published_at: None,
        }];
        let set = build_candidates(&course, &web);
        assert_eq!(set[0].reference.id, "ref1");
        assert_eq!(set[0].reference.page_or_slide(), Some(2));
        assert_eq!(set[1].reference.id, "ref2");
        assert_eq!(set[1].reference.source, "en.wikipedia.org");
        assert!(matches!(set[1].reference.target, ReferenceTarget::Web { .. }));
    }

    #[test]
    fn strips_markers_for_history() {
        assert_eq!(strip_markers("Paris [ref1]."), "Paris .");
        assert_eq!(strip_markers("a [ref1] b"), "a b");
    }
}
