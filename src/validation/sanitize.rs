use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Cleans one string: drops NUL and control characters (keeping `\t`, `\n`,
/// `\r`), strips HTML tags, decodes the five basic entities, and trims.
pub fn sanitize_str(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|&c| !(c.is_ascii_control() && !matches!(c, '\t' | '\n' | '\r')))
        .collect();

    HTML_TAG
        .replace_all(&cleaned, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_owned()
}

/// Applies [`sanitize_str`] to every string in `value`, recursing through
/// arrays and objects. Object keys are left alone.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, sanitize(v))).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_tags_and_control_characters() {
        assert_eq!(sanitize_str("  <script>alert(1)</script>ok\0\u{7}  "), "alert(1)ok");
        assert_eq!(sanitize_str("line\tone\nline two"), "line\tone\nline two");
    }

    #[test]
    fn decodes_entities_after_stripping_tags() {
        assert_eq!(sanitize_str("a &lt;b&gt; &amp; &quot;c&quot; &#x27;d&#x27;"), "a <b> & \"c\" 'd'");
    }

    #[test]
    fn recurses_through_structures() {
        let value = json!({
            "reason": " <i>spam</i> ",
            "tags": ["<b>x</b>", 3, null],
            "nested": { "notes": "\u{0}ok" }
        });
        assert_eq!(
            sanitize(value),
            json!({ "reason": "spam", "tags": ["x", 3, null], "nested": { "notes": "ok" } })
        );
    }
}
