use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved context key the dialog service uses to name the next action.
pub const ACTION_KEY: &str = "action";

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ConverseRequest<'a> {
    pub input: InputText<'a>,
    pub context: &'a Map<String, Value>,
    pub workspace_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct InputText<'a> {
    pub text: &'a str,
}

/// One entity extracted by the dialog service, e.g. a selection index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity: String,
    pub value: String,
}

/// Oracle response for a single turn. The context blob is opaque to callers
/// except for the reserved `action` key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConverseResponse {
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, deserialize_with = "deserialize_output_lines")]
    pub output: Vec<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl ConverseResponse {
    /// The action named by the returned context, if any.
    pub fn action(&self) -> Option<&str> {
        self.context.get(ACTION_KEY).and_then(Value::as_str)
    }

    /// Output lines joined the way the original bot rendered them: one
    /// line per entry, each newline-terminated.
    pub fn output_text(&self) -> String {
        let mut text = String::new();
        for line in &self.output {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

// The service nests output lines under `output.text`.
fn deserialize_output_lines<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Output {
        #[serde(default)]
        text: Vec<String>,
    }
    let output = Output::deserialize(deserializer)?;
    Ok(output.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_parses_nested_output_lines() {
        let parsed: ConverseResponse = serde_json::from_value(json!({
            "context": { "action": "search_topic", "topic": "ai" },
            "output": { "text": ["Searching for ai...", "One moment."] },
            "entities": [ { "entity": "selection", "value": "2" } ]
        }))
        .expect("parse converse response");

        assert_eq!(parsed.action(), Some("search_topic"));
        assert_eq!(parsed.output_text(), "Searching for ai...\nOne moment.\n");
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].value, "2");
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let parsed: ConverseResponse =
            serde_json::from_value(json!({})).expect("parse empty response");
        assert!(parsed.context.is_empty());
        assert!(parsed.action().is_none());
        assert_eq!(parsed.output_text(), "");
    }
}
