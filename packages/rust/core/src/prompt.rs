//! Research prompt rendering.

use leadscout_shared::{Locality, ResearchConfig};

/// Prompt template handed to the state machine on every submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptConfig {
    /// Template with `{locality}`, `{record_types}` and `{schema}` placeholders.
    pub template: String,
}

impl PromptConfig {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn from_config(config: &ResearchConfig) -> Self {
        Self::new(config.prompt_template.clone())
    }

    /// Substitute the placeholders. Templates written for the older
    /// `{city}` / `{lead_types}` names render the same way.
    pub fn render(
        &self,
        locality: &Locality,
        record_types: &[String],
        schema: &serde_json::Value,
    ) -> String {
        let types = if record_types.is_empty() {
            "any".to_string()
        } else {
            record_types.join(", ")
        };
        let schema =
            serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
        let locality = locality.to_string();

        self.template
            .replace("{locality}", &locality)
            .replace("{city}", &locality)
            .replace("{record_types}", &types)
            .replace("{lead_types}", &types)
            .replace("{schema}", &schema)
    }
}
