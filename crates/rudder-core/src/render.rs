//! Chart renderer contract

use std::collections::BTreeMap;

use crate::chart::Chart;
use crate::error::{CoreError, Result};
use crate::values::Values;

/// Turns a chart and values into named documents
///
/// Keys are template paths prefixed by the chart name
/// (`<chart>/templates/x.yaml`). A document whose path ends with
/// `NOTES.txt` is treated as release notes, not as a resource.
pub trait Renderer: Send + Sync {
    fn render(&self, chart: &Chart, values: &Values) -> Result<BTreeMap<String, String>>;
}

/// Renderer for charts whose templates are already rendered
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRenderer;

impl Renderer for PassthroughRenderer {
    fn render(&self, chart: &Chart, _values: &Values) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for template in &chart.templates {
            let key = format!("{}/{}", chart.metadata.name, template.path);
            if out.insert(key.clone(), template.data.clone()).is_some() {
                return Err(CoreError::Render {
                    message: format!("duplicate template path '{}'", key),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_prefixes_chart_name() {
        let chart = Chart::new("hello", "0.1.0")
            .unwrap()
            .with_template("templates/cm.yaml", "kind: ConfigMap")
            .with_template("templates/NOTES.txt", "hi");

        let out = PassthroughRenderer.render(&chart, &Values::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out["hello/templates/cm.yaml"], "kind: ConfigMap");
        assert!(out.contains_key("hello/templates/NOTES.txt"));
    }

    #[test]
    fn test_passthrough_rejects_duplicates() {
        let chart = Chart::new("hello", "0.1.0")
            .unwrap()
            .with_template("templates/a.yaml", "x")
            .with_template("templates/a.yaml", "y");
        assert!(PassthroughRenderer.render(&chart, &Values::new()).is_err());
    }
}
