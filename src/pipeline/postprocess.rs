//! Post-processing: turn model output into plain spoken text.
//!
//! Language models love markdown even when told not to use it. Anything
//! left in the narration ends up read aloud by the speech backend ("asterisk
//! asterisk revenue"), so every narration passes through [`clean_narration`]
//! before synthesis.
//!
//! ## Rule order
//!
//! Inline code is unwrapped first so emphasis markers inside backticks are
//! still seen by the later rules. Bold runs before italics so `**x**` is not
//! read as two empty italic spans. The rule set is applied until it reaches a
//! fixed point; every rule only ever deletes characters, so the loop always
//! terminates and the result is idempotent.

use once_cell::sync::Lazy;
use regex::Regex;

/// Full cleanup applied to each generated narration.
///
/// 1. Strip outer ```` ``` ```` fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Remove invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Strip markdown syntax ([`strip_markdown`])
pub fn clean_narration(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    strip_markdown(&s)
}

// ── Markdown stripping ───────────────────────────────────────────────────────

static RE_INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static RE_BOLD_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.*?)\*\*").unwrap());
static RE_BOLD_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"__(.*?)__").unwrap());
static RE_ITALIC_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.*?)\*").unwrap());
static RE_ITALIC_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_(.*?)_").unwrap());
static RE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*#+[ \t]*").unwrap());
static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(.*?)\]\(.*?\)").unwrap());
static RE_BLOCKQUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*>[ \t]?").unwrap());
static RE_LIST_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*[-+*][ \t]+").unwrap());

/// Remove markdown syntax, keeping the text it wraps.
///
/// Handles inline code, bold, italics, ATX headers, links, blockquotes,
/// list markers and table pipes. `strip_markdown(strip_markdown(x)) ==
/// strip_markdown(x)` for every input.
pub fn strip_markdown(input: &str) -> String {
    let mut current = input.trim().to_string();
    loop {
        let next = strip_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_once(input: &str) -> String {
    let s = RE_INLINE_CODE.replace_all(input, "$1");
    let s = RE_BOLD_STAR.replace_all(&s, "$1");
    let s = RE_BOLD_UNDERSCORE.replace_all(&s, "$1");
    let s = RE_ITALIC_STAR.replace_all(&s, "$1");
    let s = RE_ITALIC_UNDERSCORE.replace_all(&s, "$1");
    let s = RE_HEADER.replace_all(&s, "");
    let s = RE_LINK.replace_all(&s, "$1");
    let s = RE_BLOCKQUOTE.replace_all(&s, "");
    let s = RE_LIST_MARKER.replace_all(&s, "");
    s.replace('|', "").trim().to_string()
}

// ── Fences ───────────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*)\n```\s*$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Tests ────────────────────────────────────────────────────────────────────
