use serde::{Deserialize, Serialize};

use crate::visibility::VisibilityMode;

/// Engine tuning. Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct EngineConfig {
    /// Upper bound on refresh passes while calculated and initial values settle.
    pub max_calculation_passes: usize,
    /// What an enablement expression that fails to evaluate resolves to.
    pub enablement_fallback: VisibilityMode,
    /// Remove answers of disabled items from [`crate::FormEngine::submission`].
    pub strip_disabled_on_submit: bool,
    /// Base URL of a terminology server used for `answerValueSet` expansion.
    pub terminology_server: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_calculation_passes: 10,
            enablement_fallback: VisibilityMode::default(),
            strip_disabled_on_submit: true,
            terminology_server: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_value(json!({"enablement_fallback": "hidden"})).expect("config");
        assert_eq!(config.enablement_fallback, VisibilityMode::Hidden);
        assert_eq!(config.max_calculation_passes, 10);
        assert!(config.strip_disabled_on_submit);
    }
}
