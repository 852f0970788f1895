use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// Longest string `sanitize_text` lets through, in characters.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Longest filename `sanitize_filename` produces, in characters.
pub const MAX_FILENAME_CHARS: usize = 255;

/// RFC 5321 path limit.
pub const MAX_EMAIL_LEN: usize = 254;

/// Ports of remote-administration services a user-supplied URL may not target.
pub const BLOCKED_URL_PORTS: &[u16] = &[21, 22, 23, 25, 445, 3389, 5900, 5985, 5986];

static EMAIL_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9\-]+(\.[a-z0-9\-]+)*\.[a-z]{2,}$").expect("valid regex")
});

/// Normalize free text.
///
/// Non-whitespace control characters are removed, whitespace runs collapse to
/// a single space, the result is trimmed and capped at [`MAX_TEXT_CHARS`].
/// Applying it twice gives the same result as applying it once.
pub fn sanitize_text(input: &str) -> String {
    let stripped: String = input
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect();

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_TEXT_CHARS {
        return collapsed;
    }

    let truncated: String = collapsed.chars().take(MAX_TEXT_CHARS).collect();
    truncated.trim_end().to_string()
}

/// Return the canonical form of an http(s) URL, or `""` when it is not one
/// we are willing to store.
pub fn sanitize_url(input: &str) -> String {
    let Ok(url) = Url::parse(input.trim()) else {
        return String::new();
    };

    if !matches!(url.scheme(), "http" | "https") {
        return String::new();
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return String::new(),
    }

    if url
        .port()
        .is_some_and(|port| BLOCKED_URL_PORTS.contains(&port))
    {
        return String::new();
    }

    url.to_string()
}

/// Make a user-supplied filename safe to use as a single path component.
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut previous_dot = false;

    for c in input.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            c
        } else {
            '_'
        };

        if c == '.' {
            if previous_dot || out.is_empty() {
                // leading dots go, dot runs collapse
                previous_dot = true;
                continue;
            }
            previous_dot = true;
        } else {
            previous_dot = false;
        }
        out.push(c);
    }

    out.chars().take(MAX_FILENAME_CHARS).collect()
}

/// Lower-case and shape-check an email address; `""` when it is unusable.
pub fn sanitize_email(input: &str) -> String {
    let email = input.trim().to_lowercase();

    if email.is_empty() || email.len() > MAX_EMAIL_LEN || email.contains("..") {
        return String::new();
    }

    if !EMAIL_SHAPE.is_match(&email) {
        return String::new();
    }

    email
}
