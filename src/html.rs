/// Minimal escaping for text nodes and attribute values in the rendered
/// markup. Markup here is assembled by hand (no templating layer), so every
/// user-entered string must pass through one of these.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Attribute position uses the same replacement set; kept as a separate name
/// so call sites read as intent.
pub fn attr(s: &str) -> String {
    escape(s)
}
