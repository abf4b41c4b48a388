// Fragment merge
//
// Deterministic and pure: order by index, join non-failed texts with
// paragraph breaks, count words. Running it twice over the same fragments
// produces byte-identical output.

use crate::models::TranscriptFragment;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub final_transcript: String,
    pub word_count: usize,
    pub failed_segments: usize,
}

pub fn merge_fragments(fragments: &[TranscriptFragment]) -> MergeResult {
    let mut ordered: Vec<&TranscriptFragment> = fragments.iter().collect();
    ordered.sort_by_key(|f| f.index);

    let mut parts = Vec::new();
    let mut word_count = 0usize;
    let mut failed_segments = 0usize;

    for fragment in ordered {
        if fragment.is_failed() {
            failed_segments += 1;
            continue;
        }
        let text = fragment.text.trim();
        if text.is_empty() {
            continue;
        }
        word_count += text.split_whitespace().count();
        parts.push(text.to_string());
    }

    MergeResult {
        final_transcript: parts.join("\n\n"),
        word_count,
        failed_segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FAILED_FRAGMENT_TEXT;

    fn fragment(index: usize, text: &str) -> TranscriptFragment {
        TranscriptFragment {
            index,
            start_time_sec: index as f64 * 60.0,
            end_time_sec: (index + 1) as f64 * 60.0,
            text: text.to_string(),
            confidence: if text == FAILED_FRAGMENT_TEXT { 0.0 } else { 1.0 },
            sub_segments: Vec::new(),
        }
    }

    #[test]
    fn joins_in_index_order_with_paragraph_breaks() {
        // Out-of-order input still merges by index.
        let fragments = vec![fragment(2, "third part"), fragment(0, "first"), fragment(1, "second bit here")];
        let result = merge_fragments(&fragments);
        assert_eq!(result.final_transcript, "first\n\nsecond bit here\n\nthird part");
        assert_eq!(result.word_count, 6);
        assert_eq!(result.failed_segments, 0);
    }

    #[test]
    fn failed_fragments_are_skipped_and_counted() {
        let fragments = vec![
            fragment(0, "kept"),
            fragment(1, FAILED_FRAGMENT_TEXT),
            fragment(2, "also kept"),
        ];
        let result = merge_fragments(&fragments);
        assert_eq!(result.final_transcript, "kept\n\nalso kept");
        assert_eq!(result.failed_segments, 1);
        assert_eq!(result.word_count, 3);
    }

    #[test]
    fn merge_is_idempotent() {
        let fragments = vec![fragment(0, "  padded text  "), fragment(1, "more")];
        let first = merge_fragments(&fragments);
        let second = merge_fragments(&fragments);
        assert_eq!(first, second);
        assert_eq!(first.final_transcript, "padded text\n\nmore");
    }

    #[test]
    fn empty_input_merges_to_empty() {
        let result = merge_fragments(&[]);
        assert_eq!(result.final_transcript, "");
        assert_eq!(result.word_count, 0);
    }
}
