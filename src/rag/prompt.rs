use serde_json::{Map, Value};

use crate::models::PromptTemplate;

/// Build the final prompt text.
///
/// A non-blank raw `prompt` on the template is returned as-is. Otherwise
/// every non-blank part becomes a `# Heading` section, in a fixed order.
pub fn compose(
    template: &PromptTemplate,
    user_input: &str,
    context: &str,
    additional_context: &Map<String, Value>,
) -> String {
    if let Some(raw) = template.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        return raw.to_string();
    }

    let additional = render_additional_context(additional_context);

    let sections: [(&str, Option<&str>); 9] = [
        ("Main Instructions", template.main_instructions.as_deref()),
        ("Business Description", template.business_description.as_deref()),
        ("Customer Profile", template.customer_profile.as_deref()),
        ("Rules and Filters", template.rules_and_filters.as_deref()),
        ("Example Outputs", template.example_outputs.as_deref()),
        ("Additional Guidance", template.guidance_override.as_deref()),
        ("Context", Some(context)),
        ("Additional Context", Some(additional.as_str())),
        ("User Input", Some(user_input)),
    ];

    let mut prompt = String::new();
    for (heading, body) in sections {
        let Some(body) = body.map(str::trim).filter(|b| !b.is_empty()) else {
            continue;
        };
        prompt.push_str("# ");
        prompt.push_str(heading);
        prompt.push('\n');
        prompt.push_str(body);
        prompt.push_str("\n\n");
    }

    prompt.trim_end().to_string()
}

/// `key: value` per entry, insertion order. Strings are written unquoted.
fn render_additional_context(map: &Map<String, Value>) -> String {
    map.iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}: {}", key, s),
            other => format!("{}: {}", key, other),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> PromptTemplate {
        PromptTemplate {
            main_instructions: Some("Be concise.".to_string()),
            customer_profile: Some("SMB owners".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_sections_in_fixed_order_without_empty_headers() {
        let prompt = compose(&template(), "What is new?", "", &Map::new());
        assert_eq!(
            prompt,
            "# Main Instructions\nBe concise.\n\n# Customer Profile\nSMB owners\n\n# User Input\nWhat is new?"
        );
        assert!(!prompt.contains("# Business Description"));
        assert!(!prompt.contains("# Context"));
    }

    #[test]
    fn test_context_and_additional_context() {
        let extra = json!({"tone": "friendly", "limit": 3, "tags": ["a", "b"]});
        let prompt = compose(
            &template(),
            "Q",
            "chunk one\nchunk two",
            extra.as_object().unwrap(),
        );
        let context_at = prompt.find("# Context\nchunk one\nchunk two").unwrap();
        let extra_at = prompt
            .find("# Additional Context\ntone: friendly\nlimit: 3\ntags: [\"a\",\"b\"]")
            .unwrap();
        let input_at = prompt.find("# User Input\nQ").unwrap();
        assert!(context_at < extra_at && extra_at < input_at);
    }

    #[test]
    fn test_raw_override_is_verbatim() {
        let t = PromptTemplate {
            prompt: Some("  Exactly this.\n".to_string()),
            main_instructions: Some("ignored".to_string()),
            ..Default::default()
        };
        assert_eq!(compose(&t, "input", "context", &Map::new()), "  Exactly this.\n");
    }

    #[test]
    fn test_blank_override_falls_back_to_sections() {
        let t = PromptTemplate {
            prompt: Some("   ".to_string()),
            ..template()
        };
        assert!(compose(&t, "Q", "", &Map::new()).starts_with("# Main Instructions"));
    }

    #[test]
    fn test_deterministic() {
        let extra = json!({"b": 1, "a": 2});
        let a = compose(&template(), "Q", "ctx", extra.as_object().unwrap());
        let b = compose(&template(), "Q", "ctx", extra.as_object().unwrap());
        assert_eq!(a, b);
        assert!(a.find("b: 1").unwrap() < a.find("a: 2").unwrap());
    }

    #[test]
    fn test_assistant_default_has_instructions() {
        let prompt = compose(&PromptTemplate::assistant_default(), "hi", "", &Map::new());
        assert!(prompt.starts_with(
            "# Main Instructions\nYou are a helpful assistant that answers questions based on the provided context."
        ));
        assert!(prompt.ends_with("# User Input\nhi"));
    }
}
