use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine options and logical layer-name bindings for the target project.
/// Every field has a default, so a partial TOML file is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Retry a failed node-label match with trailing non-digit characters
    /// stripped from both labels.
    pub remove_trailing_chars: bool,
    /// Slack, in the channel's length unit, allowed past the last matched
    /// segment before an observation distance counts as out of bounds.
    pub tolerance_channel_length: f64,
    pub channel_layer: String,
    pub structure_layer: String,
    pub maintenance_layer: String,
    pub damage_layer: String,
    pub file_layer: String,
    pub join_layer: String,
    pub organisation_layer: String,
    /// Operating-company organisation reference stamped onto examination
    /// events, when the host has one selected.
    pub operating_company: Option<String>,
    /// Default directory hint for the survey-file picker.
    pub source_path_hint: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            remove_trailing_chars: false,
            tolerance_channel_length: 1.0,
            channel_layer: "vw_qgep_reach".to_string(),
            structure_layer: "od_wastewater_structure".to_string(),
            maintenance_layer: "vw_qgep_maintenance".to_string(),
            damage_layer: "vw_qgep_damage".to_string(),
            file_layer: "od_file".to_string(),
            join_layer: "re_maintenance_event_wastewater_structure".to_string(),
            organisation_layer: "od_organisation".to_string(),
            operating_company: None,
            source_path_hint: String::new(),
        }
    }
}

impl ImportConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "remove_trailing_chars = true\ntolerance_channel_length = 0.5\nchannel_layer = \"my_reaches\""
        )
        .expect("write config");

        let config = ImportConfig::from_toml_file(file.path()).expect("load config");
        assert!(config.remove_trailing_chars);
        assert_eq!(config.tolerance_channel_length, 0.5);
        assert_eq!(config.channel_layer, "my_reaches");
        assert_eq!(config.damage_layer, "vw_qgep_damage");
        assert_eq!(config.operating_company, None);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "tolerance_channel_length = \"not a number\"").expect("write config");
        let err = ImportConfig::from_toml_file(file.path()).expect_err("must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
