//! Markdown chunking: splits a file into heading-scoped chunks bounded by
//! size thresholds. Code fences are never split. Translates the reference
//! algorithm's section-then-accumulate shape onto a `pulldown-cmark` event
//! stream instead of a full AST.

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Parser, Tag, TagEnd};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_id: String,
    pub chunk_index: u32,
    pub heading_path: String,
    pub content: String,
    pub token_count: u32,
}

/// Normalize a path for hashing/storage: forward slashes, no leading separator.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// 16-hex-character id derived from `(normalized_path, chunk_index)`. Stable
/// across reindex runs as long as the chunk's position in the file doesn't
/// change.
pub fn make_chunk_id(path: &str, chunk_index: u32) -> String {
    let key = format!("{}::{}", normalize_path(path), chunk_index);
    let digest = Sha256::digest(key.as_bytes());
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{:02x}", b)).collect()
}

fn whitespace_token_count(s: &str) -> u32 {
    s.split_whitespace().count() as u32
}

struct Section {
    heading_path: String,
    parts: Vec<String>,
}

/// Chunk a Markdown document into heading-scoped, size-bounded chunks.
pub fn chunk_markdown(
    markdown_text: &str,
    relative_path: &str,
    max_chunk_chars: usize,
    min_chunk_chars: usize,
) -> Vec<Chunk> {
    let sections = split_into_sections(markdown_text);

    let mut chunks = Vec::new();
    let mut chunk_index: u32 = 0;

    for section in sections {
        let mut current = String::new();

        for part in section.parts {
            if part.trim().is_empty() {
                continue;
            }
            let proposal = if current.is_empty() {
                part.clone()
            } else {
                format!("{}\n\n{}", current, part)
            };

            if proposal.chars().count() <= max_chunk_chars || current.is_empty() {
                current = proposal;
            } else {
                if current.chars().count() >= min_chunk_chars {
                    chunks.push(make_chunk(
                        relative_path,
                        chunk_index,
                        &section.heading_path,
                        &current,
                    ));
                    chunk_index += 1;
                }
                current = part;
            }
        }

        if !current.is_empty() && current.chars().count() >= min_chunk_chars {
            chunks.push(make_chunk(
                relative_path,
                chunk_index,
                &section.heading_path,
                &current,
            ));
            chunk_index += 1;
        }
    }

    chunks
}

fn make_chunk(relative_path: &str, chunk_index: u32, heading_path: &str, content: &str) -> Chunk {
    Chunk {
        chunk_id: make_chunk_id(relative_path, chunk_index),
        chunk_index,
        heading_path: heading_path.to_string(),
        content: content.to_string(),
        token_count: whitespace_token_count(content),
    }
}

fn heading_level_num(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

/// Walk the event stream, grouping content into `(heading_path, parts)`
/// sections. Fenced code blocks are captured verbatim with their info
/// string and never split across parts.
fn split_into_sections(markdown_text: &str) -> Vec<Section> {
    let parser = Parser::new(markdown_text);

    let mut sections: Vec<Section> = vec![Section {
        heading_path: String::new(),
        parts: Vec::new(),
    }];
    let mut heading_stack: Vec<(u8, String)> = Vec::new();

    let mut in_heading = false;
    let mut heading_text = String::new();
    let mut heading_level: u8 = 0;

    let mut in_code_block = false;
    let mut code_info = String::new();
    let mut code_body = String::new();

    let mut text_buf = String::new();

    for event in parser {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                flush_text(&mut text_buf, &mut sections);
                in_heading = true;
                heading_text.clear();
                heading_level = heading_level_num(level);
            }
            Event::End(TagEnd::Heading(_)) => {
                in_heading = false;
                heading_stack.retain(|(lvl, _)| *lvl < heading_level);
                heading_stack.push((heading_level, heading_text.trim().to_string()));
                let heading_path = heading_stack
                    .iter()
                    .map(|(_, t)| t.as_str())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join(" > ");
                sections.push(Section {
                    heading_path,
                    parts: Vec::new(),
                });
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                flush_text(&mut text_buf, &mut sections);
                in_code_block = true;
                code_body.clear();
                code_info = match kind {
                    CodeBlockKind::Fenced(info) => info.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code_block = false;
                let fenced = format!("```{}\n{}```", code_info, ensure_trailing_newline(&code_body));
                if let Some(last) = sections.last_mut() {
                    last.parts.push(fenced);
                }
            }
            Event::Text(text) => {
                if in_heading {
                    heading_text.push_str(&text);
                } else if in_code_block {
                    code_body.push_str(&text);
                } else {
                    text_buf.push_str(&text);
                }
            }
            Event::Code(text) => {
                if in_heading {
                    heading_text.push_str(&text);
                } else {
                    text_buf.push('`');
                    text_buf.push_str(&text);
                    text_buf.push('`');
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if !in_code_block {
                    text_buf.push(' ');
                }
            }
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::TableCell) => {
                flush_text(&mut text_buf, &mut sections);
            }
            _ => {}
        }
    }
    flush_text(&mut text_buf, &mut sections);

    sections.into_iter().filter(|s| !s.parts.is_empty()).collect()
}

fn ensure_trailing_newline(s: &str) -> String {
    if s.ends_with('\n') {
        s.to_string()
    } else {
        format!("{}\n", s)
    }
}

fn flush_text(buf: &mut String, sections: &mut Vec<Section>) {
    let trimmed = buf.trim();
    if !trimmed.is_empty() {
        if let Some(last) = sections.last_mut() {
            last.parts.push(trimmed.to_string());
        }
    }
    buf.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_strips_leading_slash_and_backslashes() {
        assert_eq!(normalize_path("/a\\b/c.md"), "a/b/c.md");
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let a = make_chunk_id("docs/one.md", 0);
        let b = make_chunk_id("docs/one.md", 0);
        assert_eq!(a, b);
        assert_ne!(a, make_chunk_id("docs/one.md", 1));
    }

    #[test]
    fn heading_breadcrumb_is_assembled() {
        let text = "# Top\n\nintro text\n\n## Mid\n\nmid text that is definitely long enough to pass the minimum chunk size threshold for a single chunk emission here.\n";
        let chunks = chunk_markdown(text, "doc.md", 2000, 10);
        assert!(chunks.iter().any(|c| c.heading_path == "Top"));
        assert!(chunks.iter().any(|c| c.heading_path == "Top > Mid"));
    }

    #[test]
    fn empty_heading_segment_is_dropped_from_breadcrumb() {
        let text = "# Top\n\n##\n\ncontent under an untitled subheading that is long enough to be kept here.\n";
        let chunks = chunk_markdown(text, "doc.md", 2000, 10);
        assert!(chunks.iter().any(|c| c.heading_path == "Top"));
        assert!(!chunks.iter().any(|c| c.heading_path.contains("Top > ")));
    }

    #[test]
    fn short_chunks_below_minimum_are_dropped() {
        let text = "# Top\n\nhi\n";
        let chunks = chunk_markdown(text, "doc.md", 2000, 120);
        assert!(chunks.is_empty());
    }

    #[test]
    fn code_fence_never_split_and_preserves_info_string() {
        let body = "fn main() {\n    println!(\"hi\");\n}";
        let text = format!("# Code\n\n```rust\n{}\n```\n", body);
        let chunks = chunk_markdown(&text, "doc.md", 5, 1);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.starts_with("```rust\n"));
        assert!(chunks[0].content.contains("println!"));
    }

    #[test]
    fn chunk_index_is_monotone_across_sections() {
        let text = "# A\n\nsection a content long enough to form a chunk on its own merits here today.\n\n## B\n\nsection b content long enough to form a chunk on its own merits here today too.\n";
        let chunks = chunk_markdown(text, "doc.md", 50, 10);
        let indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
        for w in indices.windows(2) {
            assert_eq!(w[1], w[0] + 1);
        }
    }

    #[test]
    fn oversized_section_splits_into_multiple_chunks() {
        let part = "x".repeat(50);
        let text = format!(
            "# Top\n\n{}\n\n{}\n\n{}\n",
            part.clone(),
            part.clone(),
            part
        );
        let chunks = chunk_markdown(&text, "doc.md", 60, 10);
        assert!(chunks.len() >= 2);
    }
}
