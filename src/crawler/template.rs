//! URL template rendering
//!
//! Templates use `{name}` placeholders. Values are form-urlencoded on
//! substitution so search keys with spaces or CJK text stay valid URLs.

use crate::HarvestError;

/// Placeholder names a mode URL template may use
pub const KNOWN_PLACEHOLDERS: &[&str] = &["key", "start", "end", "page", "id"];

/// Returns the placeholder names in a template, in order of appearance
///
/// Fails on an unterminated `{` or an empty `{}`.
pub fn placeholders(template: &str) -> Result<Vec<&str>, String> {
    let mut names = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{}'", template))?;
        let name = &after[..close];
        if name.is_empty() {
            return Err(format!("empty placeholder in '{}'", template));
        }
        if name.contains('{') {
            return Err(format!("nested placeholder in '{}'", template));
        }
        names.push(name);
        rest = &after[close + 1..];
    }

    Ok(names)
}

/// Renders a template, substituting each placeholder with its encoded value
pub fn render(template: &str, values: &[(&str, &str)]) -> Result<String, HarvestError> {
    let names = placeholders(template).map_err(HarvestError::Template)?;
    let mut rendered = template.to_string();

    for name in names {
        let value = values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                HarvestError::Template(format!("no value for {{{}}} in '{}'", name, template))
            })?;
        let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
        rendered = rendered.replacen(&format!("{{{}}}", name), &encoded, 1);
    }

    Ok(rendered)
}
