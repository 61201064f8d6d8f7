use serde::{Deserialize, Serialize};

/// A tool the model may call, described by a JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    /// Name the model uses to call the tool.
    pub name: String,
    /// What the tool does, shown to the model.
    pub description: String,
    /// JSON schema of the tool arguments.
    pub parameters: serde_json::Value,
}

/// How the model is allowed to use the supplied tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// Tools must not be called.
    None,
    /// At least one tool must be called.
    Required,
    /// Force a call to the named tool.
    Tool(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_choice_named_serialization() {
        let json = serde_json::to_string(&ToolChoice::Tool("search".into())).unwrap();
        assert_eq!(json, r#"{"tool":"search"}"#);
        let auto = serde_json::to_string(&ToolChoice::Auto).unwrap();
        assert_eq!(auto, r#""auto""#);
    }
}
