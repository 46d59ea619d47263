use std::collections::{BTreeMap, HashSet};
use tantivy::tokenizer::{TextAnalyzer, TokenStream};

/// Console-log fragment highlighter.
///
/// The text is cut into fixed-size windows; every window containing a query
/// term becomes a candidate fragment, scored by how many distinct terms it
/// holds. The best `max_fragments` come back best-first with matches wrapped
/// in the pre/post tags.
pub struct Highlighter {
    pre_tag: String,
    post_tag: String,
    max_fragments: usize,
    fragment_size: usize,
}

impl Default for Highlighter {
    fn default() -> Self {
        Self {
            pre_tag: "<B>".to_string(),
            post_tag: "</B>".to_string(),
            max_fragments: Self::MAX_FRAGMENTS,
            fragment_size: 100,
        }
    }
}

impl Highlighter {
    pub const MAX_FRAGMENTS: usize = 5;

    pub fn new(pre_tag: String, post_tag: String) -> Self {
        Self {
            pre_tag,
            post_tag,
            ..Default::default()
        }
    }

    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size.max(1);
        self
    }

    /// Byte spans of every token in `text` whose analyzed form is in `terms`.
    pub fn matching_spans(
        analyzer: &mut TextAnalyzer,
        text: &str,
        terms: &HashSet<String>,
    ) -> Vec<(usize, usize)> {
        if terms.is_empty() {
            return Vec::new();
        }
        let mut spans = Vec::new();
        let mut stream = analyzer.token_stream(text);
        while stream.advance() {
            let token = stream.token();
            if terms.contains(&token.text) {
                spans.push((token.offset_from, token.offset_to));
            }
        }
        spans
    }

    pub fn best_fragments(&self, text: &str, spans: &[(usize, usize)]) -> Vec<String> {
        if spans.is_empty() || self.max_fragments == 0 {
            return Vec::new();
        }

        let mut buckets: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for &(start, end) in spans {
            if start < end && end <= text.len() {
                buckets
                    .entry(start / self.fragment_size)
                    .or_default()
                    .push((start, end));
            }
        }

        let mut fragments: Vec<(usize, usize, usize, String)> = Vec::new();
        let mut prev_end = 0;
        for (bucket, mut hits) in buckets {
            hits.sort_unstable();
            let mut start = floor_char_boundary(text, bucket * self.fragment_size).max(prev_end);
            start = start.min(hits[0].0);
            let window_end = floor_char_boundary(
                text,
                ((bucket + 1) * self.fragment_size).min(text.len()),
            );
            let end = hits
                .iter()
                .map(|&(_, e)| e)
                .max()
                .unwrap_or(window_end)
                .max(window_end);
            prev_end = end;

            let mut rendered = String::with_capacity(end - start + hits.len() * 8);
            let mut distinct = HashSet::new();
            let mut cursor = start;
            for &(s, e) in &hits {
                if s < cursor {
                    continue;
                }
                rendered.push_str(&text[cursor..s]);
                rendered.push_str(&self.pre_tag);
                rendered.push_str(&text[s..e]);
                rendered.push_str(&self.post_tag);
                distinct.insert(text[s..e].to_lowercase());
                cursor = e;
            }
            rendered.push_str(&text[cursor..end]);

            fragments.push((distinct.len(), hits.len(), bucket, rendered));
        }

        fragments.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
        fragments
            .into_iter()
            .take(self.max_fragments)
            .map(|(_, _, _, f)| f)
            .collect()
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use tantivy::tokenizer::{LowerCaser, SimpleTokenizer};

    fn analyzer() -> TextAnalyzer {
        TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(LowerCaser)
            .build()
    }

    fn terms(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_wraps_matches() {
        let text = "+ echo hello\nhello";
        let spans = Highlighter::matching_spans(&mut analyzer(), text, &terms(&["echo"]));
        let fragments = Highlighter::default().best_fragments(text, &spans);
        assert_eq!(fragments, vec!["+ <B>echo</B> hello\nhello"]);
    }

    #[test]
    fn test_case_insensitive_match_keeps_original_text() {
        let text = "ERROR: Build FAILED";
        let spans = Highlighter::matching_spans(&mut analyzer(), text, &terms(&["failed"]));
        let fragments = Highlighter::default().best_fragments(text, &spans);
        assert_eq!(fragments, vec!["ERROR: Build <B>FAILED</B>"]);
    }

    #[test]
    fn test_no_terms_no_fragments() {
        let text = "nothing to see";
        let spans = Highlighter::matching_spans(&mut analyzer(), text, &HashSet::new());
        assert!(Highlighter::default().best_fragments(text, &spans).is_empty());
    }

    #[test]
    fn test_caps_fragment_count_and_prefers_richer_fragments() {
        let mut text = String::new();
        for i in 0..10 {
            text.push_str(&format!("line{:02} echo padding padding\n", i));
        }
        text.push_str("echo cat together\n");
        let hl = Highlighter::default().with_fragment_size(32);
        let spans = Highlighter::matching_spans(&mut analyzer(), &text, &terms(&["echo", "cat"]));
        let fragments = hl.best_fragments(&text, &spans);
        assert_eq!(fragments.len(), Highlighter::MAX_FRAGMENTS);
        assert!(fragments[0].contains("<B>cat</B>"));
    }

    #[test]
    fn test_multibyte_boundaries() {
        let text = "ééééé echo ééééé";
        let hl = Highlighter::default().with_fragment_size(3);
        let spans = Highlighter::matching_spans(&mut analyzer(), text, &terms(&["echo"]));
        let fragments = hl.best_fragments(text, &spans);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].contains("<B>echo</B>"));
    }

    #[test]
    fn test_custom_tags() {
        let text = "echo";
        let hl = Highlighter::new("<em>".into(), "</em>".into());
        assert_eq!(hl.best_fragments(text, &[(0, 4)]), vec!["<em>echo</em>"]);
    }
}
