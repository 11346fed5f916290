//! Partition repository content into model-sized chunks.
//!
//! Chunks are order preserving and lossless: concatenating every segment of
//! every chunk in order yields exactly the scoped file texts, and no chunk
//! holds more than the budget.

use serde::Serialize;

use crate::{RepositoryContent, Scope};

/// Budgets below this cannot hold an arbitrary UTF-8 character. Settings with
/// a smaller budget are rejected before a run starts.
pub const MIN_BUDGET: usize = 4;

/// Position of a fragment when a file had to be split.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Fragment {
    pub part: usize,
    pub of: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Segment {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<Fragment>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub segments: Vec<Segment>,
}

impl Chunk {
    /// Content size in bytes.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.text.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for seg in &self.segments {
            if out.last() != Some(&seg.path.as_str()) {
                out.push(&seg.path);
            }
        }
        out
    }

    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }
}

struct Packer {
    budget: usize,
    chunks: Vec<Chunk>,
    open: Vec<Segment>,
    used: usize,
}

impl Packer {
    fn flush(&mut self) {
        if self.open.is_empty() {
            return;
        }
        let index = self.chunks.len();
        self.chunks.push(Chunk {
            index,
            segments: std::mem::take(&mut self.open),
        });
        self.used = 0;
    }

    fn push(&mut self, segment: Segment) {
        if !self.open.is_empty() && self.used + segment.text.len() > self.budget {
            self.flush();
        }
        self.used += segment.text.len();
        self.open.push(segment);
    }
}

/// Greedily pack the files selected by `scope` into chunks of at most
/// `budget` bytes. Always returns at least one chunk; when nothing is in
/// scope that chunk is empty.
pub fn chunk_content(content: &RepositoryContent, scope: &Scope, budget: usize) -> Vec<Chunk> {
    let mut packer = Packer {
        budget,
        chunks: Vec::new(),
        open: Vec::new(),
        used: 0,
    };

    for file in content.files.iter().filter(|f| scope.matches(&f.path)) {
        if file.text.len() <= budget {
            packer.push(Segment {
                path: file.path.clone(),
                fragment: None,
                text: file.text.clone(),
            });
            continue;
        }

        let pieces = split_text(&file.text, budget);
        let of = pieces.len();
        for (i, piece) in pieces.into_iter().enumerate() {
            // An oversized file starts a fresh chunk; its last fragment stays
            // open so following files can pack behind it.
            packer.flush();
            packer.push(Segment {
                path: file.path.clone(),
                fragment: Some(Fragment { part: i + 1, of }),
                text: piece.to_string(),
            });
        }
    }
    packer.flush();

    if packer.chunks.is_empty() {
        packer.chunks.push(Chunk {
            index: 0,
            segments: Vec::new(),
        });
    }
    packer.chunks
}

/// Split `text` into pieces of at most `budget` bytes, cutting at line ends.
/// A single line longer than the budget is cut at character boundaries; a
/// character wider than the budget becomes a piece of its own.
pub fn split_text(text: &str, budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut end = 0;

    for line in text.split_inclusive('\n') {
        let line_start = end;
        let line_end = line_start + line.len();

        if line.len() > budget {
            if end > start {
                pieces.push(&text[start..end]);
            }
            let mut cut_from = line_start;
            while line_end - cut_from > budget {
                let mut cut = char_floor(text, cut_from + budget);
                if cut == cut_from {
                    cut = char_ceil(text, cut_from + 1);
                }
                pieces.push(&text[cut_from..cut]);
                cut_from = cut;
            }
            start = cut_from;
            end = line_end;
            continue;
        }

        if line_end - start > budget {
            pieces.push(&text[start..end]);
            start = end;
        }
        end = line_end;
    }

    if end > start {
        pieces.push(&text[start..end]);
    }
    pieces
}

fn char_floor(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn char_ceil(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileRecord;

    fn content(files: &[(&str, &str)]) -> RepositoryContent {
        RepositoryContent {
            tree: String::new(),
            files: files
                .iter()
                .map(|(p, t)| FileRecord {
                    path: p.to_string(),
                    text: t.to_string(),
                })
                .collect(),
            unread: Vec::new(),
        }
    }

    fn joined(chunks: &[Chunk]) -> String {
        chunks.iter().map(Chunk::text).collect()
    }

    #[test]
    fn packs_whole_files_until_budget() {
        let c = content(&[("a", "aaaa\n"), ("b", "bbbb\n"), ("c", "cccc\n")]);
        let chunks = chunk_content(&c, &Scope::all(), 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].paths(), ["a", "b"]);
        assert_eq!(chunks[1].paths(), ["c"]);
        assert!(chunks.iter().all(|ch| ch.len() <= 10));
        assert!(chunks[0].segments.iter().all(|s| s.fragment.is_none()));
    }

    #[test]
    fn oversized_file_is_split_at_line_boundaries() {
        let big = "line one\nline two\nline three\n";
        let c = content(&[("small", "s\n"), ("big", big), ("tail", "t")]);
        let chunks = chunk_content(&c, &Scope::all(), 12);

        assert_eq!(joined(&chunks), format!("s\n{big}t"));
        assert!(chunks.iter().all(|ch| ch.len() <= 12));

        let fragments: Vec<_> = chunks
            .iter()
            .flat_map(|ch| &ch.segments)
            .filter(|s| s.path == "big")
            .collect();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].text, "line one\n");
        assert_eq!(fragments[2].fragment, Some(Fragment { part: 3, of: 3 }));

        // the tail file packs behind the last fragment
        let last = chunks.last().unwrap();
        assert_eq!(last.paths(), ["big", "tail"]);
    }

    #[test]
    fn long_line_is_cut_on_char_boundaries() {
        let line = "héllo wörld ünïcode";
        let pieces = split_text(line, 5);
        assert_eq!(pieces.concat(), line);
        assert!(pieces.iter().all(|p| p.len() <= 5));
    }

    #[test]
    fn budgets_below_the_minimum_are_not_raised() {
        let c = content(&[("a", "abc\nde\n"), ("b", "fgh")]);
        for budget in [1, 2, 3] {
            let chunks = chunk_content(&c, &Scope::all(), budget);
            assert_eq!(joined(&chunks), "abc\nde\nfgh", "budget {budget}");
            assert!(chunks.iter().all(|ch| ch.len() <= budget), "budget {budget}");
        }
        // a character wider than the budget still makes progress
        assert_eq!(split_text("ü", 1), ["ü"]);
    }

    #[test]
    fn scope_filters_files_and_keeps_order() {
        let c = content(&[
            ("src/a.rs", "fn a() {}\n"),
            ("README.md", "# hi\n"),
            ("src/b.rs", "fn b() {}\n"),
        ]);
        let scope = Scope::compile("r", &["src/*.rs".into()]).unwrap();
        let chunks = chunk_content(&c, &scope, 1_000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].paths(), ["src/a.rs", "src/b.rs"]);
        assert_eq!(joined(&chunks), "fn a() {}\nfn b() {}\n");
    }

    #[test]
    fn nothing_in_scope_yields_one_empty_chunk() {
        let c = content(&[("a.txt", "x")]);
        let scope = Scope::compile("r", &["missing.md".into()]).unwrap();
        let chunks = chunk_content(&c, &scope, 100);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn lossless_and_bounded_for_mixed_inputs() {
        let long_line = "x".repeat(97);
        let many_lines = "0123456789\n".repeat(40);
        let c = content(&[
            ("empty", ""),
            ("one", "1\n"),
            ("long_line", &long_line),
            ("many", &many_lines),
            ("no_newline", "tail without newline"),
        ]);
        let expected: String = c.files.iter().map(|f| f.text.as_str()).collect();

        for budget in [4, 7, 16, 33, 64, 500, 10_000] {
            let chunks = chunk_content(&c, &Scope::all(), budget);
            assert_eq!(joined(&chunks), expected, "budget {budget}");
            assert!(chunks.iter().all(|ch| ch.len() <= budget), "budget {budget}");
            for (i, ch) in chunks.iter().enumerate() {
                assert_eq!(ch.index, i);
            }
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "abc\n".repeat(100);
        let c = content(&[("a", &text), ("b", "b\n"), ("c", &text)]);
        let first = chunk_content(&c, &Scope::all(), 50);
        let second = chunk_content(&c, &Scope::all(), 50);
        assert_eq!(first, second);
    }
}
