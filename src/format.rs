//! Pure output formatting: per-mode escaping, markdown-to-HTML conversion,
//! lossless length splitting, and the ordered fallback plan.
//!
//! Nothing here touches the transport. The delivery coordinator drives the
//! actual send attempts because only it observes transport-level rejection.

use regex::Regex;
use std::sync::LazyLock;

/// Output syntax attempted against the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Legacy markdown: small reserved set, unforgiving parser.
    Markdown,
    /// MarkdownV2: larger reserved set.
    MarkdownV2,
    /// HTML tags with `< > &` entity escaping.
    Html,
    /// No markup at all; markers stripped from the text.
    Plain,
}

impl std::fmt::Display for RenderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderMode::Markdown => write!(f, "Markdown"),
            RenderMode::MarkdownV2 => write!(f, "MarkdownV2"),
            RenderMode::Html => write!(f, "HTML"),
            RenderMode::Plain => write!(f, "plain"),
        }
    }
}

/// One planned delivery attempt: a mode plus the chunks to send in order.
#[derive(Debug, Clone)]
pub struct RenderAttempt {
    pub mode: RenderMode,
    pub chunks: Vec<String>,
}

const MARKDOWN_RESERVED: &[char] = &['_', '*', '[', ']', '(', ')', '`'];
const MARKDOWN_V2_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Escape the legacy-markdown reserved set with backslashes.
pub fn escape_markdown(text: &str) -> String {
    escape_with(text, MARKDOWN_RESERVED)
}

/// Escape the MarkdownV2 reserved set with backslashes.
pub fn escape_markdown_v2(text: &str) -> String {
    escape_with(text, MARKDOWN_V2_RESERVED)
}

fn escape_with(text: &str, reserved: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if reserved.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

static CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\n]+?)`").unwrap());
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*\n]+?)\*\*").unwrap());
static ITALIC_STAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*\n]+?)\*").unwrap());
static ITALIC_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_([^_\n]+?)_").unwrap());

/// Convert the structural markdown subset (bold, italic, code spans) to HTML
/// tags. `& < >` are entity-escaped in all content first, so anything the
/// conversion does not recognize renders literally.
pub fn markdown_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");

    let converted = CODE.replace_all(&escaped, "<code>$1</code>");
    let converted = BOLD.replace_all(&converted, "<b>$1</b>");
    let converted = ITALIC_STAR.replace_all(&converted, "<i>$1</i>");
    let converted = ITALIC_UNDERSCORE.replace_all(&converted, "<i>$1</i>");
    converted.into_owned()
}

/// Remove markup markers entirely (bold, italic, code, strikethrough).
pub fn strip_markup(text: &str) -> String {
    text.chars()
        .filter(|ch| !matches!(ch, '*' | '_' | '`' | '~'))
        .collect()
}

/// Prepare raw text for one render mode. Splitting runs on the output of
/// this, never on the raw text.
pub fn escape_for_mode(text: &str, mode: RenderMode) -> String {
    match mode {
        RenderMode::Markdown => escape_markdown(text),
        RenderMode::MarkdownV2 => escape_markdown_v2(text),
        RenderMode::Html => markdown_to_html(text),
        RenderMode::Plain => strip_markup(text),
    }
}

/// Split `text` into chunks of at most `max_length` characters whose
/// concatenation reproduces it exactly.
///
/// Cut-point priority within each window: the last paragraph boundary (blank
/// line), then the last line break, then the last space, then a hard cut at
/// the limit. A hard cut never lands between a backslash and the character it
/// escapes.
pub fn split_to_fit(text: &str, max_length: usize) -> Vec<String> {
    // A zero limit can never make progress; one character per chunk is the
    // smallest honest answer.
    let max_length = max_length.max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while chars.len() - start > max_length {
        let cut = find_cut(&chars, start, start + max_length);
        chunks.push(chars[start..cut].iter().collect());
        start = cut;
    }
    chunks.push(chars[start..].iter().collect());
    chunks
}

fn find_cut(chars: &[char], start: usize, limit: usize) -> usize {
    // Cut just after a blank line, as close to the limit as possible.
    for i in ((start + 2)..=limit).rev() {
        if chars[i - 1] == '\n' && chars[i - 2] == '\n' {
            return i;
        }
    }
    for i in ((start + 1)..=limit).rev() {
        if chars[i - 1] == '\n' {
            return i;
        }
    }
    for i in ((start + 1)..=limit).rev() {
        if chars[i - 1] == ' ' {
            return i;
        }
    }

    // Hard cut. An odd run of trailing backslashes means the last one escapes
    // the next character, so it moves to the following chunk.
    let mut backslashes = 0;
    while limit - backslashes > start && chars[limit - backslashes - 1] == '\\' {
        backslashes += 1;
    }
    if backslashes % 2 == 1 && limit - 1 > start {
        limit - 1
    } else {
        limit
    }
}

/// The ordered modes a delivery attempt walks through: the preferred mode,
/// the alternate markup syntax, then plain text.
pub fn fallback_modes(preferred: RenderMode) -> Vec<RenderMode> {
    match preferred {
        RenderMode::Markdown => vec![RenderMode::Markdown, RenderMode::Html, RenderMode::Plain],
        RenderMode::MarkdownV2 => {
            vec![RenderMode::MarkdownV2, RenderMode::Html, RenderMode::Plain]
        }
        RenderMode::Html => vec![RenderMode::Html, RenderMode::Markdown, RenderMode::Plain],
        RenderMode::Plain => vec![RenderMode::Plain],
    }
}

/// Plan the full fallback chain for `text`: escaping and splitting re-run per
/// mode, pre-materialized so an attempt can restart at any chunk.
pub fn render_with_fallback(
    text: &str,
    preferred: RenderMode,
    max_length: usize,
) -> Vec<RenderAttempt> {
    fallback_modes(preferred)
        .into_iter()
        .map(|mode| RenderAttempt {
            mode,
            chunks: split_to_fit(&escape_for_mode(text, mode), max_length),
        })
        .collect()
}
