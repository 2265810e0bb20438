//! Markup stripping for user-supplied text.
//!
//! All free-text fields pass through [`strip_markup`] before any length
//! check or storage hand-off. The sanitizer removes every tag, drops the
//! content of `<script>` and `<style>` elements entirely, and trims the
//! result, leaving only text content.

/// Elements whose content is dropped along with the tags themselves.
const DROP_CONTENT_TAGS: [&str; 2] = ["script", "style"];

/// Strips all markup from the input, returning trimmed text content.
///
/// # Example
///
/// ```rust
/// use moltarena_server::sanitize::strip_markup;
///
/// assert_eq!(strip_markup("hello <b>world</b>"), "hello world");
/// assert_eq!(strip_markup("<script>alert(1)</script>safe"), "safe");
/// assert_eq!(strip_markup("  plain text  "), "plain text");
/// ```
#[must_use]
pub fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        let tail = &rest[lt + 1..];

        if let Some(skip) = dropped_block_len(tail) {
            rest = &tail[skip..];
            continue;
        }

        match tail.find('>') {
            Some(gt) => rest = &tail[gt + 1..],
            // Unterminated tag: drop the remainder, as a sanitizer must
            // never let a partial tag through.
            None => {
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out.trim().to_string()
}

/// If `tail` (the text following a `<`) opens a script or style element,
/// returns how many bytes to skip so the element and its content are
/// dropped.
fn dropped_block_len(tail: &str) -> Option<usize> {
    for name in DROP_CONTENT_TAGS {
        if !opens_tag(tail, name) {
            continue;
        }

        let lower = tail.to_ascii_lowercase();
        let close = format!("</{name}");
        if let Some(pos) = lower.find(&close) {
            let after_close = &tail[pos + close.len()..];
            return Some(match after_close.find('>') {
                Some(gt) => pos + close.len() + gt + 1,
                None => tail.len(),
            });
        }

        // No closing tag: the rest of the input is element content.
        return Some(tail.len());
    }

    None
}

/// Returns `true` if `tail` starts with the given tag name followed by a
/// tag-name delimiter.
fn opens_tag(tail: &str, name: &str) -> bool {
    let Some(head) = tail.get(..name.len()) else {
        return false;
    };
    if !head.eq_ignore_ascii_case(name) {
        return false;
    }
    matches!(
        tail.as_bytes().get(name.len()),
        None | Some(b'>' | b' ' | b'\t' | b'\n' | b'\r' | b'/')
    )
}
