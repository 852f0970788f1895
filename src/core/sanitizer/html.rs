//! Allow-list HTML cleaner for rich-text fields.
use once_cell::sync::Lazy;
use regex::Regex;

/// Tags kept by [`sanitize_html`]; everything else is unwrapped.
pub const ALLOWED_TAGS: &[&str] = &["p", "br", "strong", "em", "b", "i", "u", "ul", "ol", "li"];

/// Elements removed together with everything inside them.
const STRIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "noscript", "template",
];

static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?(-->|$)").expect("valid regex"));

// The regex crate has no backreferences, so each element gets its own pair.
static STRIPPED_BLOCKS: Lazy<Vec<(Regex, Regex)>> = Lazy::new(|| {
    STRIPPED_ELEMENTS
        .iter()
        .map(|name| {
            let block = Regex::new(&format!(r"(?is)<\s*{name}\b[^>]*>.*?<\s*/\s*{name}\s*>"))
                .expect("valid regex");
            let stray = Regex::new(&format!(r"(?i)<\s*/?\s*{name}\b[^>]*>")).expect("valid regex");
            (block, stray)
        })
        .collect()
});

static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(/?)([a-z][a-z0-9]*)\b[^>]*>").expect("valid regex")
});

static DOCTYPE_OR_PI: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[!?][^>]*>").expect("valid regex"));

/// Reduce markup to a small formatting vocabulary.
///
/// Dangerous elements lose their content, comments disappear, allowed tags are
/// re-emitted bare (every attribute dropped) and unknown tags are unwrapped so
/// their text survives. A tag left open at the end of the input is dropped
/// with everything after it; any other `<` in text is escaped.
pub fn sanitize_html(input: &str) -> String {
    let mut html = COMMENT.replace_all(input, "").into_owned();

    for (block, stray) in STRIPPED_BLOCKS.iter() {
        html = block.replace_all(&html, "").into_owned();
        html = stray.replace_all(&html, "").into_owned();
    }

    html = DOCTYPE_OR_PI.replace_all(&html, "").into_owned();

    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for caps in TAG.captures_iter(&html) {
        let Some(tag) = caps.get(0) else { continue };
        if !push_text(&mut out, &html[last..tag.start()]) {
            return out;
        }
        last = tag.end();

        let name = caps[2].to_ascii_lowercase();
        if !ALLOWED_TAGS.contains(&name.as_str()) {
            continue;
        }
        if name == "br" {
            out.push_str("<br>");
        } else {
            out.push('<');
            out.push_str(&caps[1]);
            out.push_str(&name);
            out.push('>');
        }
    }
    push_text(&mut out, &html[last..]);
    out
}

/// Append text between tags. Returns `false` when the text opens a tag that
/// never closes; the rest of the input is discarded at that point.
fn push_text(out: &mut String, text: &str) -> bool {
    let mut rest = text;
    while let Some(pos) = rest.find('<') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if after
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'))
        {
            return false;
        }
        out.push_str("&lt;");
        rest = after;
    }
    out.push_str(rest);
    true
}
