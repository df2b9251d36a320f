//! Content-rendering port.
//!
//! Template engines are external collaborators; the runtime only needs a
//! narrow seam: render a template string against a JSON context. The default
//! [`PassthroughRenderer`] substitutes `{{var}}` placeholders, which is
//! enough for display rendering and storage round-trips. Richer engines plug
//! in by implementing [`ContentRenderer`].

use crate::Result;
use serde_json::Value;

/// Renders template content parts against a context snapshot.
///
/// Implementations must be pure with respect to their inputs: rendering the
/// same template against the same context yields the same output. The store
/// relies on this when reproducing messages from storage snapshots.
pub trait ContentRenderer: Send + Sync {
    /// Render `template` using values from `context`.
    fn render(&self, template: &str, context: &Value) -> Result<String>;
}

/// Minimal built-in renderer: replaces `{{name}}` placeholders with values
/// looked up in the context object. Unknown placeholders are left verbatim;
/// non-string values render as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRenderer;

impl ContentRenderer for PassthroughRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let key = after[..end].trim();
                    match context.get(key) {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(other) => out.push_str(&other.to_string()),
                        None => {
                            // Unknown placeholder stays as-is
                            out.push_str(&rest[start..start + 2 + end + 2]);
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    // Unterminated braces are literal text
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitutes_string_values() {
        let out = PassthroughRenderer
            .render("Hello {{name}}!", &json!({"name": "Ada"}))
            .unwrap();
        assert_eq!(out, "Hello Ada!");
    }

    #[test]
    fn test_substitutes_json_values() {
        let out = PassthroughRenderer
            .render("n = {{n}}", &json!({"n": 42}))
            .unwrap();
        assert_eq!(out, "n = 42");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let out = PassthroughRenderer
            .render("{{missing}} stays", &json!({}))
            .unwrap();
        assert_eq!(out, "{{missing}} stays");
    }

    #[test]
    fn test_unterminated_braces_are_literal() {
        let out = PassthroughRenderer
            .render("broken {{oops", &json!({"oops": "x"}))
            .unwrap();
        assert_eq!(out, "broken {{oops");
    }

    #[test]
    fn test_multiple_placeholders() {
        let out = PassthroughRenderer
            .render("{{a}}-{{b}}-{{a}}", &json!({"a": "1", "b": "2"}))
            .unwrap();
        assert_eq!(out, "1-2-1");
    }
}
