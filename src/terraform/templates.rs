use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

static TEMPLATE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    pub id: String,
    /// File name to contents; only `*.tf` files.
    pub files: BTreeMap<String, String>,
    pub required_variables: Vec<String>,
}

impl Template {
    pub fn missing_variables(&self, given: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
        self.required_variables
            .iter()
            .filter(|v| !given.contains_key(v.as_str()))
            .cloned()
            .collect()
    }
}

#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn load(&self, template_id: &str) -> Result<Option<Template>, String>;
}

/// `variables.json` next to the `.tf` files.
#[derive(Debug, Deserialize)]
struct VariablesFile {
    #[serde(default)]
    required: Vec<String>,
}

/// Reads `<root>/<template_id>/*.tf` and an optional `variables.json`.
pub struct DirectoryTemplates {
    root: PathBuf,
}

impl DirectoryTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl TemplateSource for DirectoryTemplates {
    async fn load(&self, template_id: &str) -> Result<Option<Template>, String> {
        if !TEMPLATE_ID.is_match(template_id) {
            return Err(format!("invalid template id: {template_id}"));
        }

        let dir = self.root.join(template_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("Failed to read {}: {e}", dir.display())),
        };

        let mut template = Template {
            id: template_id.to_string(),
            ..Template::default()
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("Failed to list {}: {e}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if name.ends_with(".tf") {
                let body = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
                template.files.insert(name, body);
            } else if name == "variables.json" {
                let raw = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
                let vars: VariablesFile = serde_json::from_str(&raw)
                    .map_err(|e| format!("Invalid {}: {e}", path.display()))?;
                template.required_variables = vars.required;
            }
        }

        if template.files.is_empty() {
            return Ok(None);
        }
        Ok(Some(template))
    }
}

/// Fixed in-memory templates.
#[derive(Default)]
pub struct StaticTemplates {
    templates: HashMap<String, Template>,
}

impl StaticTemplates {
    pub fn with(mut self, template: Template) -> Self {
        self.templates.insert(template.id.clone(), template);
        self
    }
}

#[async_trait]
impl TemplateSource for StaticTemplates {
    async fn load(&self, template_id: &str) -> Result<Option<Template>, String> {
        Ok(self.templates.get(template_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_templates_read_tf_files_and_variables() {
        let root = std::env::temp_dir().join(format!("cloudpilot-tpl-{}", uuid::Uuid::now_v7()));
        let dir = root.join("web-tier");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("main.tf"), "resource \"null_resource\" \"x\" {}")
            .await
            .unwrap();
        tokio::fs::write(dir.join("README.md"), "ignored").await.unwrap();
        tokio::fs::write(dir.join("variables.json"), r#"{"required": ["region"]}"#)
            .await
            .unwrap();

        let source = DirectoryTemplates::new(&root);
        let template = source.load("web-tier").await.unwrap().unwrap();
        assert_eq!(template.files.keys().collect::<Vec<_>>(), vec!["main.tf"]);
        assert_eq!(template.required_variables, vec!["region"]);
        assert!(source.load("absent").await.unwrap().is_none());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn path_traversal_is_refused() {
        let source = DirectoryTemplates::new(std::env::temp_dir());
        assert!(source.load("../etc").await.is_err());
    }

    #[test]
    fn missing_variables_are_reported() {
        let template = Template {
            id: "t".into(),
            files: BTreeMap::new(),
            required_variables: vec!["region".into(), "size".into()],
        };
        let mut given = serde_json::Map::new();
        given.insert("region".into(), serde_json::json!("eu-west-1"));
        assert_eq!(template.missing_variables(&given), vec!["size".to_string()]);
    }
}
