#![forbid(unsafe_code)]

//! Removal of `<think>...</think>` spans from model output.
//!
//! Reasoning models interleave their internal monologue with the answer; the
//! frontend must never see it. For streamed output the tags routinely arrive
//! split across deltas — sometimes mid-tag — so the filter keeps two pieces
//! of state per stream: whether we are inside an unclosed think block, and a
//! held-back fragment suffix that could still turn out to be the start of a
//! tag.

use once_cell::sync::Lazy;
use regex::Regex;

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Streaming filter. Construct one per upstream stream and feed it every
/// text fragment in arrival order; it returns the visible portion of each
/// fragment. Call [`ThinkFilter::finish`] at end of stream to flush any
/// held-back suffix that never became a tag.
#[derive(Debug, Default)]
pub struct ThinkFilter {
    inside: bool,
    pending: String,
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters one fragment. State survives across calls, so a tag split
    /// over two or more fragments is still recognized.
    pub fn push(&mut self, fragment: &str) -> String {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(fragment);
        let mut rest = text.as_str();
        let mut out = String::new();

        loop {
            if self.inside {
                match rest.find(CLOSE_TAG) {
                    Some(end) => {
                        rest = &rest[end + CLOSE_TAG.len()..];
                        self.inside = false;
                    }
                    None => {
                        // Everything is monologue, but a suffix like "</thi"
                        // may complete into the close tag next fragment.
                        self.pending = partial_tag_suffix(rest, CLOSE_TAG).to_string();
                        return out;
                    }
                }
            }

            match rest.find(OPEN_TAG) {
                Some(start) => {
                    out.push_str(&rest[..start]);
                    rest = &rest[start + OPEN_TAG.len()..];
                    self.inside = true;
                }
                None => {
                    let held = partial_tag_suffix(rest, OPEN_TAG);
                    out.push_str(&rest[..rest.len() - held.len()]);
                    self.pending = held.to_string();
                    return out;
                }
            }
        }
    }

    /// Returns whatever was held back waiting for a tag that never arrived.
    /// Text inside an unterminated think block stays dropped.
    pub fn finish(self) -> String {
        if self.inside { String::new() } else { self.pending }
    }
}

/// Longest suffix of `text` that is a non-empty proper prefix of `tag`.
fn partial_tag_suffix<'a>(text: &'a str, tag: &str) -> &'a str {
    let max = tag.len().min(text.len() + 1);
    for len in (1..max).rev() {
        if text.ends_with(&tag[..len]) {
            return &text[text.len() - len..];
        }
    }
    ""
}

static THINK_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid think-span regex"));

/// Removes every well-formed think span from a complete string and trims the
/// result. Used for one-shot engine results that arrive fully assembled.
pub fn strip_think_blocks(text: &str) -> String {
    THINK_SPAN.replace_all(text, "").trim().to_string()
}
