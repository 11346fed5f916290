use std::borrow::Cow;

use rulegate_core::chunk::Chunk;
use rulegate_core::Rule;

/// Marker line carrying the rule id. Exactly one per prompt.
pub const RULE_ID_PREFIX: &str = "RULE ID: ";

const OUTPUT_CONTRACT: &str = "{\"compliant\": true|false, \
\"evidence\": \"<short verbatim quote from the content that supports the verdict>\", \
\"location\": \"<file path and line, or directory, the evidence comes from>\"}";

pub fn system_prompt() -> String {
    "You are a repository compliance reviewer. You receive exactly one rule, the repository's \
directory structure, and some or all of the repository content the rule applies to. Decide \
whether the content shown complies with the rule.\n\n\
Focus on:\n\
- The rule text exactly as written. Do not add requirements it does not state.\n\
- Concrete evidence. Quote the smallest piece of content that proves the verdict.\n\
- Structure. For rules about required files or layout, the directory structure is complete \
even when file contents are partial.\n\n\
Do NOT:\n\
- Judge other rules or give general advice.\n\
- Mark content non-compliant because something is merely absent from a partial view, \
unless the rule requires it to be in these files.\n\
- Wrap the answer in prose or markdown.\n\n\
Output ONLY one JSON object."
        .to_string()
}

/// Render one chunk's files with path headers for model consumption.
pub fn serialize_chunk(chunk: &Chunk) -> String {
    let mut out = String::with_capacity(chunk.len() + 256);

    if chunk.is_empty() {
        out.push_str("(no files in this rule's scope were found in the repository)\n");
        return out;
    }

    for seg in &chunk.segments {
        out.push_str("=== FILE: ");
        out.push_str(&seg.path);
        if let Some(f) = seg.fragment {
            out.push_str(&format!(" (part {} of {})", f.part, f.of));
        }
        out.push_str(" ===\n");
        out.push_str(&seg.text);
        if !seg.text.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("=== END FILE ===\n");
    }

    out
}

/// One self-contained validation prompt for one rule against one chunk.
pub fn build_prompt(rule: &Rule, chunk: &Chunk, total_chunks: usize, tree: &str) -> String {
    let mut out = String::with_capacity(chunk.len() + tree.len() + 1024);

    out.push_str(RULE_ID_PREFIX);
    out.push_str(&rule.id);
    out.push('\n');
    out.push_str("CATEGORY: ");
    out.push_str(rule.category.as_str());
    out.push('\n');
    out.push_str("CRITICALITY: ");
    out.push_str(rule.criticality.as_str());
    out.push('\n');
    out.push_str("SCOPE: ");
    if rule.scope.is_all() {
        out.push_str("entire repository");
    } else {
        out.push_str(&rule.scope.patterns().join(", "));
    }
    out.push_str("\nRULE:\n");
    out.push_str(&rule.description);
    out.push('\n');
    if let Some(explanation) = &rule.explanation {
        out.push_str("EXPLANATION:\n");
        out.push_str(explanation);
        out.push('\n');
    }

    out.push_str("\nDIRECTORY STRUCTURE:\n");
    if tree.trim().is_empty() {
        out.push_str("(not available)\n");
    } else {
        out.push_str(tree);
        if !tree.ends_with('\n') {
            out.push('\n');
        }
    }

    out.push_str(&format!(
        "\nCONTENT (part {} of {}):\n",
        chunk.index + 1,
        total_chunks.max(1)
    ));
    out.push_str(&serialize_chunk(chunk));

    if total_chunks > 1 {
        out.push_str(
            "\nThis is only one part of the content in scope. Report non-compliance only if \
this part shows a violation of the rule.\n",
        );
    }

    out.push_str("\nRespond with ONLY this JSON object, nothing else:\n");
    out.push_str(OUTPUT_CONTRACT);
    out.push('\n');

    out
}

/// Keep whole lines of `tree` within `max_bytes`, noting how many were left out.
pub fn fit_tree(tree: &str, max_bytes: usize) -> Cow<'_, str> {
    if tree.len() <= max_bytes {
        return Cow::Borrowed(tree);
    }

    const NOTE_ROOM: usize = 64;
    let keep = max_bytes.saturating_sub(NOTE_ROOM);
    let mut end = 0;
    let mut kept = 0;
    for line in tree.split_inclusive('\n') {
        if end + line.len() > keep {
            break;
        }
        end += line.len();
        kept += 1;
    }
    let omitted = tree.split_inclusive('\n').count() - kept;

    let mut out = tree[..end].to_string();
    out.push_str(&format!("... ({omitted} more entries not shown)\n"));
    Cow::Owned(out)
}

/// Follow-up sent once when the model's answer did not match the contract.
pub fn clarify_prompt(original: &str, bad_output: &str, problem: &str) -> String {
    let mut shown = bad_output.trim();
    if shown.len() > 2_000 {
        let mut cut = 2_000;
        while !shown.is_char_boundary(cut) {
            cut -= 1;
        }
        shown = &shown[..cut];
    }
    format!(
        "{original}\n\
YOUR PREVIOUS ANSWER could not be used ({problem}):\n{shown}\n\n\
Answer again with ONLY one JSON object of exactly this shape and no other text:\n{OUTPUT_CONTRACT}\n"
    )
}
