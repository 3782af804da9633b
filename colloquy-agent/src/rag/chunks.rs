//! Deterministic text splitters used before embedding.

use regex::Regex;
use std::sync::LazyLock;

static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*#+[ \t]+.*$").expect("Invalid header regex"));

/// Splits markdown at every header line.
///
/// Text before the first header is kept as its own section. Sections are
/// trimmed and empty ones dropped. Without any header the whole trimmed text
/// is returned as a single section.
pub fn split_markdown_by_sections(markdown: &str) -> Vec<String> {
    let trimmed = markdown.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let starts: Vec<usize> = HEADER.find_iter(markdown).map(|m| m.start()).collect();
    if starts.is_empty() {
        return vec![trimmed.to_string()];
    }

    let mut sections = Vec::with_capacity(starts.len() + 1);
    push_trimmed(&mut sections, &markdown[..starts[0]]);
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(markdown.len());
        push_trimmed(&mut sections, &markdown[start..end]);
    }
    sections
}

/// Splits markdown only at headers of exactly `level` hashes.
///
/// Deeper headers stay inside their parent section. `level` 0 yields nothing.
pub fn split_markdown_by_level(level: usize, markdown: &str) -> Vec<String> {
    if level == 0 {
        return Vec::new();
    }

    let mut sections = Vec::new();
    let mut current = String::new();
    for line in markdown.lines() {
        if header_level(line) == Some(level) && !current.trim().is_empty() {
            push_trimmed(&mut sections, &current);
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    push_trimmed(&mut sections, &current);
    sections
}

fn header_level(line: &str) -> Option<usize> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 {
        return None;
    }
    match trimmed[hashes..].chars().next() {
        Some(' ') | Some('\t') => Some(hashes),
        _ => None,
    }
}

fn push_trimmed(sections: &mut Vec<String>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        sections.push(text.to_string());
    }
}

/// Fixed-size windows over characters, each starting `size - overlap` after
/// the previous one. An overlap of `size` or more is clamped so the window
/// always moves forward.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() || size == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    let step = size - overlap.min(size - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Default ingestion policy: one chunk per markdown section, with sections
/// longer than `max_chunk` characters cut into windows overlapping by 10%.
pub fn chunk_document(markdown: &str, max_chunk: usize) -> Vec<String> {
    let overlap = max_chunk / 10;
    split_markdown_by_sections(markdown)
        .into_iter()
        .flat_map(|section| {
            if max_chunk > 0 && section.chars().count() > max_chunk {
                chunk_text(&section, max_chunk, overlap)
            } else {
                vec![section]
            }
        })
        .collect()
}

/// Extracts every complete `<tag ...>...</tag>` or self-closing `<tag .../>`
/// element, in document order.
pub fn chunk_xml(xml: &str, tag: &str) -> Vec<String> {
    let tag = regex::escape(tag);
    let pattern = format!(r"<{tag}(?:\s[^>]*)?(?:/>|>[\s\S]*?</{tag}>)");
    let Ok(element) = Regex::new(&pattern) else {
        return Vec::new();
    };
    element
        .find_iter(xml)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DOC: &str = "Intro text.\n\n# Title\nBody one.\n\n## Sub\nBody two.\n\n# Second\nBody three.\n";

    #[test]
    fn test_split_by_sections_keeps_preamble() {
        let sections = split_markdown_by_sections(DOC);
        assert_eq!(
            sections,
            vec![
                "Intro text.",
                "# Title\nBody one.",
                "## Sub\nBody two.",
                "# Second\nBody three.",
            ]
        );
    }

    #[rstest]
    #[case("", 0)]
    #[case("   \n\t", 0)]
    #[case("no headers here", 1)]
    #[case("# Only\n", 1)]
    #[case("#hashtag is not a header", 1)]
    fn test_split_by_sections_edges(#[case] input: &str, #[case] expected: usize) {
        assert_eq!(split_markdown_by_sections(input).len(), expected);
    }

    #[test]
    fn test_split_by_sections_indented_and_tabbed_headers() {
        let sections = split_markdown_by_sections("  ### Deep\nbody\n#\tTabbed\nmore");
        assert_eq!(sections, vec!["### Deep\nbody", "#\tTabbed\nmore"]);
    }

    #[test]
    fn test_split_by_level_keeps_subsections_inside() {
        let sections = split_markdown_by_level(1, DOC);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[1], "# Title\nBody one.\n\n## Sub\nBody two.");

        let level_two = split_markdown_by_level(2, DOC);
        assert_eq!(level_two.len(), 2);
        assert!(level_two[1].starts_with("## Sub"));
        assert!(split_markdown_by_level(0, DOC).is_empty());
    }

    #[rstest]
    #[case("abcdefghij", 4, 0, vec!["abcd", "efgh", "ij"])]
    #[case("abcdefghij", 4, 2, vec!["abcd", "cdef", "efgh", "ghij"])]
    #[case("abcdef", 3, 3, vec!["abc", "bcd", "cde", "def"])]
    #[case("abc", 10, 2, vec!["abc"])]
    #[case("", 4, 1, vec![])]
    fn test_chunk_text(
        #[case] text: &str,
        #[case] size: usize,
        #[case] overlap: usize,
        #[case] expected: Vec<&str>,
    ) {
        assert_eq!(chunk_text(text, size, overlap), expected);
    }

    #[test]
    fn test_chunk_text_counts_chars_not_bytes() {
        let chunks = chunk_text("héllo wörld", 5, 0);
        assert_eq!(chunks, vec!["héllo", " wörl", "d"]);
    }

    #[test]
    fn test_chunk_document_splits_long_sections() {
        let long = format!("# Big\n{}", "x".repeat(45));
        let markdown = format!("# Small\nshort\n\n{}", long);
        let chunks = chunk_document(&markdown, 20);

        assert_eq!(chunks[0], "# Small\nshort");
        assert!(chunks.len() > 2);
        assert!(chunks[1..].iter().all(|c| c.chars().count() <= 20));
        assert_eq!(chunk_document(&markdown, 20), chunks);
    }

    #[test]
    fn test_chunk_xml() {
        let xml = r#"<root><item id="1">one</item><other/><item>two</item><item id="3"/></root>"#;
        assert_eq!(
            chunk_xml(xml, "item"),
            vec![r#"<item id="1">one</item>"#, "<item>two</item>", r#"<item id="3"/>"#]
        );
        assert!(chunk_xml(xml, "missing").is_empty());
        assert!(chunk_xml("<items>x</items>", "item").is_empty());
    }
}
