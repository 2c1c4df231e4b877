//! Unified-diff validation and best-effort repair.
//!
//! The oracle occasionally emits patches with escaped newlines, missing
//! line prefixes, or wrong hunk counts. Everything here is pure text
//! manipulation; actually applying a patch lives in `apply`.

use regex::Regex;

fn hunk_header_re() -> Regex {
    Regex::new(r"@@\s+-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s+@@").expect("hunk header regex")
}

/// Convert literal `\n` escape sequences into real newlines, but only when
/// the patch has no real newline at all. When both exist the literal
/// newlines win and the escapes are left alone (they may be file content).
pub fn normalize(patch: &str) -> String {
    if patch.contains("\\n") && !patch.contains('\n') {
        patch.replace("\\n", "\n")
    } else {
        patch.to_string()
    }
}

/// Structural validation: at least one `@@` hunk header, at least one
/// added or removed line, and no no-op hunk. A hunk that removes a line
/// and re-adds the byte-identical line is a corrupt generation upstream
/// and is rejected rather than repaired.
pub fn validate(patch: &str) -> bool {
    if patch.trim().is_empty() {
        return false;
    }
    let patch = normalize(patch);
    if !hunk_header_re().is_match(&patch) {
        return false;
    }

    let mut has_changes = false;
    for hunk in hunk_bodies(&patch) {
        let mut added: Vec<&str> = Vec::new();
        let mut removed: Vec<&str> = Vec::new();
        for line in hunk {
            if let Some(content) = line.strip_prefix('+') {
                added.push(content);
            } else if let Some(content) = line.strip_prefix('-') {
                removed.push(content);
            }
        }
        if !added.is_empty() || !removed.is_empty() {
            has_changes = true;
        }
        if removed.iter().any(|r| added.contains(r)) {
            return false;
        }
    }
    has_changes
}

/// Best-effort repair: normalize newlines, give unprefixed hunk-body lines
/// a leading space (treating them as context), then recount every hunk
/// header from the lines that actually follow it.
pub fn fix(patch: &str) -> String {
    let patch = normalize(patch);
    if patch.trim().is_empty() {
        return patch;
    }

    let mut fixed: Vec<String> = Vec::new();
    let mut in_hunk = false;
    for line in patch.split('\n') {
        if line.starts_with("@@") {
            in_hunk = true;
            fixed.push(line.to_string());
            continue;
        }
        if !in_hunk
            || line.trim().is_empty()
            || line.starts_with('+')
            || line.starts_with('-')
            || line.starts_with(' ')
        {
            fixed.push(line.to_string());
        } else {
            fixed.push(format!(" {}", line));
        }
    }

    recount_hunk_headers(&fixed.join("\n"))
}

/// Rewrite each `@@ -a,b +c,d @@` header so that b and d match the number
/// of removed/context and added/context lines that follow it. Blank lines
/// inside a hunk are not counted, mirroring how the patches are generated.
fn recount_hunk_headers(patch: &str) -> String {
    let header_re = hunk_header_re();
    let lines: Vec<&str> = patch.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        if !line.starts_with("@@") {
            out.push((*line).to_string());
            continue;
        }
        let Some(caps) = header_re.captures(line) else {
            out.push((*line).to_string());
            continue;
        };
        let old_start = &caps[1];
        let new_start = &caps[3];

        let mut old_count = 0usize;
        let mut new_count = 0usize;
        for next in &lines[i + 1..] {
            if next.starts_with("@@") {
                break;
            }
            if next.trim().is_empty() {
                continue;
            }
            if next.starts_with('-') {
                old_count += 1;
            } else if next.starts_with('+') {
                new_count += 1;
            } else if next.starts_with(' ') {
                old_count += 1;
                new_count += 1;
            }
        }
        out.push(format!(
            "@@ -{},{} +{},{} @@",
            old_start, old_count, new_start, new_count
        ));
    }

    out.join("\n")
}

const ANCHOR_CONTEXT_LINES: usize = 3;

/// git anchors a hunk with no trailing context to end-of-file, so a
/// mid-file hunk whose last line is a `+` or `-` change never applies.
/// Extend every such hunk with context lines copied from the file at the
/// position the hunk header claims, updating the counts to match. Hunks
/// that already end in context, or that really do sit at end-of-file, come
/// back unchanged.
pub fn anchor_trailing_context(patch: &str, file_text: &str) -> String {
    let header_re = hunk_header_re();
    let file_lines: Vec<&str> = file_text.lines().collect();
    let lines: Vec<&str> = patch.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let caps = if line.starts_with("@@") {
            header_re.captures(line)
        } else {
            None
        };
        let Some(caps) = caps else {
            out.push(line.to_string());
            i += 1;
            continue;
        };
        let old_start: usize = caps[1].parse().unwrap_or(1);
        let new_start = caps[3].to_string();

        let mut body: Vec<&str> = Vec::new();
        let mut j = i + 1;
        while j < lines.len() && !lines[j].starts_with("@@") {
            body.push(lines[j]);
            j += 1;
        }
        while body.last().is_some_and(|b| b.trim().is_empty()) {
            body.pop();
        }

        let mut old_count = 0usize;
        let mut new_count = 0usize;
        for b in &body {
            if b.trim().is_empty() {
                continue;
            }
            if b.starts_with('-') {
                old_count += 1;
            } else if b.starts_with('+') {
                new_count += 1;
            } else if b.starts_with(' ') {
                old_count += 1;
                new_count += 1;
            }
        }

        let ends_in_change = body
            .last()
            .is_some_and(|b| b.starts_with('+') || b.starts_with('-'));

        let mut extra: Vec<String> = Vec::new();
        if ends_in_change {
            // For a pure insertion (old count 0) the header names the line
            // the hunk inserts after, not the first affected line.
            let next = if old_count == 0 {
                old_start
            } else {
                old_start + old_count - 1
            };
            let from = next.min(file_lines.len());
            let to = (next + ANCHOR_CONTEXT_LINES).min(file_lines.len());
            for context in &file_lines[from..to] {
                extra.push(format!(" {}", context));
            }
        }
        old_count += extra.len();
        new_count += extra.len();

        out.push(format!(
            "@@ -{},{} +{},{} @@",
            old_start, old_count, new_start, new_count
        ));
        out.extend(body.iter().map(|b| (*b).to_string()));
        out.extend(extra);
        i = j;
    }
    out.join("\n")
}

/// Split a patch into hunk bodies: for each `@@` header, the lines up to
/// the next header (or end of patch).
fn hunk_bodies(patch: &str) -> Vec<Vec<&str>> {
    let mut hunks: Vec<Vec<&str>> = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in patch.split('\n') {
        if line.starts_with("@@") {
            if let Some(done) = current.take() {
                hunks.push(done);
            }
            current = Some(Vec::new());
        } else if let Some(body) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some(done) = current.take() {
        hunks.push(done);
    }
    hunks
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_PATCH: &str = "@@ -5,3 +5,3 @@\n context line\n-old line\n+new line\n more context";

    #[test]
    fn normalize_converts_escapes_when_no_real_newlines() {
        let escaped = "@@ -1,1 +1,2 @@\\n context\\n+added";
        let normalized = normalize(escaped);
        assert!(normalized.contains('\n'));
        assert!(!normalized.contains("\\n"));
    }

    #[test]
    fn normalize_trusts_real_newlines_over_escapes() {
        let mixed = "@@ -1,1 +1,2 @@\n context\n+printf(\"a\\n\");";
        assert_eq!(normalize(mixed), mixed);
    }

    #[test]
    fn validate_accepts_well_formed_patch() {
        assert!(validate(GOOD_PATCH));
    }

    #[test]
    fn validate_rejects_missing_hunk_header() {
        assert!(!validate("-old line\n+new line"));
    }

    #[test]
    fn validate_rejects_patch_with_no_changes() {
        assert!(!validate("@@ -5,2 +5,2 @@\n context one\n context two"));
    }

    #[test]
    fn validate_rejects_noop_hunk() {
        // Removed and added content is byte-identical: corrupt generation.
        let noop = "@@ -5,1 +5,1 @@\n-same line\n+same line";
        assert!(!validate(noop));
    }

    #[test]
    fn validate_rejects_empty() {
        assert!(!validate(""));
        assert!(!validate("   \n  "));
    }

    #[test]
    fn fix_prefixes_unprefixed_context_lines() {
        let broken = "@@ -5,2 +5,3 @@\ncontext line\n+added line\nanother context";
        let fixed = fix(broken);
        assert!(fixed.contains("\n context line"));
        assert!(fixed.contains("\n another context"));
        assert!(fixed.contains("\n+added line"));
        assert!(validate(&fixed));
    }

    #[test]
    fn fix_recounts_hunk_headers() {
        let wrong_counts = "@@ -10,99 +10,99 @@\n context\n-removed\n+added one\n+added two";
        let fixed = fix(wrong_counts);
        assert!(fixed.starts_with("@@ -10,2 +10,3 @@"));
    }

    #[test]
    fn fix_recounts_multiple_hunks_independently() {
        let patch = "@@ -1,9 +1,9 @@\n a\n+b\n@@ -20,9 +21,9 @@\n c\n-d";
        let fixed = fix(patch);
        assert!(fixed.contains("@@ -1,1 +1,2 @@"));
        assert!(fixed.contains("@@ -20,2 +21,1 @@"));
    }

    #[test]
    fn anchor_extends_hunks_ending_in_a_change() {
        let file = "alpha\nbeta\ngamma\ndelta\n";
        let patch = "@@ -2,1 +2,2 @@\n beta\n+beta prime";
        let anchored = anchor_trailing_context(patch, file);
        assert!(anchored.starts_with("@@ -2,3 +2,4 @@"));
        assert!(anchored.ends_with("\n beta\n+beta prime\n gamma\n delta"));
    }

    #[test]
    fn anchor_leaves_trailing_context_hunks_alone() {
        let file = "alpha\nbeta\ngamma\ndelta\n";
        let patch = "@@ -2,2 +2,3 @@\n beta\n+beta prime\n gamma";
        assert_eq!(anchor_trailing_context(patch, file), patch);
    }

    #[test]
    fn anchor_at_end_of_file_adds_nothing() {
        let file = "alpha\nbeta\n";
        let patch = "@@ -2,1 +2,2 @@\n beta\n+omega";
        assert_eq!(anchor_trailing_context(patch, file), patch);
    }

    #[test]
    fn anchor_handles_each_hunk_independently() {
        let file = (1..=30).map(|i| format!("row {}\n", i)).collect::<String>();
        let patch = "@@ -2,1 +2,2 @@\n row 2\n+inserted\n@@ -20,2 +21,2 @@\n row 20\n-row 21\n+row 21 changed\n row 22";
        let anchored = anchor_trailing_context(patch, &file);
        assert!(anchored.contains("@@ -2,4 +2,5 @@"));
        assert!(anchored.contains("+inserted\n row 3\n row 4\n row 5\n@@ -20,3 +21,3 @@"));
    }

    #[test]
    fn fix_leaves_text_before_first_hunk_alone() {
        let patch = "--- a/src/app.js\n+++ b/src/app.js\n@@ -1,1 +1,2 @@\n keep\n+new";
        let fixed = fix(patch);
        assert!(fixed.starts_with("--- a/src/app.js\n+++ b/src/app.js\n"));
    }
}
