//! Template rendering context

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::capabilities::Capabilities;
use crate::chart::ChartMetadata;
use crate::values::Values;

/// Context available to all templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderContext {
    /// User values (merged)
    pub values: JsonValue,

    /// Release information
    pub release: ReleaseInfo,

    /// Chart metadata
    pub chart: ChartInfo,

    /// Cluster capabilities
    pub capabilities: Capabilities,

    /// Current template info
    pub template: TemplateInfo,
}

/// Release information exposed to templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub is_install: bool,
    pub is_upgrade: bool,
    /// Name of the tool rendering the templates
    pub service: String,
}

impl ReleaseInfo {
    pub fn for_install(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision: 1,
            is_install: true,
            is_upgrade: false,
            service: "Rudder".to_string(),
        }
    }

    pub fn for_upgrade(name: &str, namespace: &str, revision: u32) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            is_install: false,
            is_upgrade: true,
            service: "Rudder".to_string(),
        }
    }
}

/// Chart information for templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
    pub app_version: Option<String>,
}

impl From<&ChartMetadata> for ChartInfo {
    fn from(meta: &ChartMetadata) -> Self {
        Self {
            name: meta.name.clone(),
            version: meta.version.to_string(),
            app_version: meta.app_version.clone(),
        }
    }
}

/// Current template information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    /// Full template path (`<chart>/templates/<file>`)
    pub name: String,

    /// Template directory of the chart being rendered
    pub base_path: String,
}

impl RenderContext {
    pub fn new(values: Values, release: ReleaseInfo, chart: &ChartMetadata) -> Self {
        Self {
            values: values.into_inner(),
            release,
            chart: ChartInfo::from(chart),
            capabilities: Capabilities::default(),
            template: TemplateInfo::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_template(mut self, name: &str, base_path: &str) -> Self {
        self.template = TemplateInfo {
            name: name.to_string(),
            base_path: base_path.to_string(),
        };
        self
    }

    /// Context for a sub-chart: scoped values, its own chart metadata
    pub fn for_subchart(&self, values: Values, chart: &ChartMetadata) -> Self {
        Self {
            values: values.into_inner(),
            release: self.release.clone(),
            chart: ChartInfo::from(chart),
            capabilities: self.capabilities.clone(),
            template: TemplateInfo::default(),
        }
    }

    /// Convert to a template-engine-friendly JSON value
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    #[test]
    fn test_render_context_json() {
        let values = Values::from_yaml("replicas: 3").unwrap();
        let release = ReleaseInfo::for_install("myapp", "default");
        let chart = ChartMetadata::new("web", Version::new(1, 2, 0));

        let json = RenderContext::new(values, release, &chart)
            .with_template("web/templates/deployment.yaml", "web/templates")
            .to_json();

        assert_eq!(json["values"]["replicas"], 3);
        assert_eq!(json["release"]["name"], "myapp");
        assert_eq!(json["release"]["isInstall"], true);
        assert_eq!(json["release"]["service"], "Rudder");
        assert_eq!(json["chart"]["version"], "1.2.0");
        assert_eq!(json["capabilities"]["kubeVersion"]["major"], "1");
        assert_eq!(json["template"]["basePath"], "web/templates");
    }

    #[test]
    fn test_subchart_context_keeps_release() {
        let parent = ChartMetadata::new("web", Version::new(1, 0, 0));
        let child = ChartMetadata::new("redis", Version::new(7, 0, 0));
        let ctx = RenderContext::new(
            Values::new(),
            ReleaseInfo::for_upgrade("myapp", "prod", 4),
            &parent,
        );

        let sub = ctx.for_subchart(Values::from_yaml("port: 6379").unwrap(), &child);
        assert_eq!(sub.release.revision, 4);
        assert_eq!(sub.chart.name, "redis");
        assert_eq!(sub.values["port"], 6379);
    }
}
