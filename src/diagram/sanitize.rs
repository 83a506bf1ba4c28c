use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

/// Rewrites model-generated flowchart source into a form the render engine parses reliably.
///
/// Block comments are removed, a line break is inserted after every `;` that is glued to
/// the next statement, and surrounding whitespace is trimmed. The function is total and
/// idempotent, so it can be re-applied every time the diagram view is activated.
pub fn sanitize(source: &str) -> String {
    let uncommented = strip_block_comments(source);
    let separated = break_after_terminators(&uncommented);
    separated.trim().to_owned()
}

/// Removes `/* ... */` spans (shortest match, left to right) until none remain, since
/// deleting one comment can splice the surrounding characters into a new opener.
/// An unterminated opener is left untouched.
fn strip_block_comments(source: &str) -> String {
    let mut current = source.to_owned();
    loop {
        let next = strip_block_comments_once(&current).into_owned();
        if next.len() == current.len() {
            return next;
        }
        current = next;
    }
}

fn strip_block_comments_once(source: &str) -> Cow<'_, str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").expect("comment pattern is valid"));
    re.replace_all(source, "")
}

fn break_after_terminators(source: &str) -> String {
    let mut output = String::with_capacity(source.len() + 8);
    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        output.push(ch);
        if ch == ';' && chars.peek().is_some_and(|next| !next.is_whitespace()) {
            output.push('\n');
        }
    }
    output
}
