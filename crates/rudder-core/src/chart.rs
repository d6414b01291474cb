//! Chart reference carried by a release

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::values::Values;

/// A chart as the engine sees it: metadata, raw templates and default values
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub metadata: ChartMetadata,

    /// Templates in declaration order
    #[serde(default)]
    pub templates: Vec<Template>,

    /// Default values shipped with the chart
    #[serde(default)]
    pub values: Values,
}

/// Chart metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name (required)
    pub name: String,

    /// Chart version (required, SemVer)
    #[serde(with = "version_serde")]
    pub version: Version,

    /// Application version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single template file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Template {
    /// Path relative to the chart root, e.g. `templates/deployment.yaml`
    pub path: String,
    pub data: String,
}

impl Chart {
    /// Create a chart with no templates
    pub fn new(name: &str, version: &str) -> Result<Self> {
        Ok(Self {
            metadata: ChartMetadata {
                name: name.to_string(),
                version: Version::parse(version)?,
                app_version: None,
                description: None,
            },
            templates: Vec::new(),
            values: Values::new(),
        })
    }

    /// Add a template (builder style)
    pub fn with_template(mut self, path: impl Into<String>, data: impl Into<String>) -> Self {
        self.templates.push(Template {
            path: path.into(),
            data: data.into(),
        });
        self
    }

    /// Replace the default values (builder style)
    pub fn with_values(mut self, values: Values) -> Self {
        self.values = values;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Reject charts that cannot be installed
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.trim().is_empty() {
            return Err(CoreError::Values {
                message: "chart name is required".to_string(),
            });
        }
        for template in &self.templates {
            if template.path.trim().is_empty() {
                return Err(CoreError::InvalidManifest {
                    path: self.metadata.name.clone(),
                    message: "template with empty path".to_string(),
                });
            }
        }
        Ok(())
    }
}

mod version_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&version.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Version, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_builder() {
        let chart = Chart::new("hello", "0.1.0")
            .unwrap()
            .with_template("templates/cm.yaml", "kind: ConfigMap");

        assert_eq!(chart.name(), "hello");
        assert_eq!(chart.metadata.version, Version::new(0, 1, 0));
        assert_eq!(chart.templates.len(), 1);
        assert!(chart.validate().is_ok());
    }

    #[test]
    fn test_chart_invalid_version() {
        assert!(matches!(
            Chart::new("hello", "not-a-version"),
            Err(CoreError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_chart_validate_empty_name() {
        let chart = Chart::new(" ", "1.0.0").unwrap();
        assert!(chart.validate().is_err());
    }

    #[test]
    fn test_chart_serde_roundtrip() {
        let chart = Chart::new("hello", "1.2.3").unwrap();
        let json = serde_json::to_string(&chart).unwrap();
        assert!(json.contains("\"version\":\"1.2.3\""));
        let back: Chart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chart);
    }
}
