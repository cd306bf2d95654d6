use handlebars::Handlebars;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::diff::{ChangeLog, DiffOperationType, Page};
use crate::error::ArtifactError;

const CHANGELOG_TEMPLATE: &str = r#"# Changelog: {{manifest_url}}

{{#if source_version}}Comparing version `{{source_version}}` to `{{target_version}}`.

{{/if}}| Change | Count |
|---|---|
| Insertions | {{inserts}} |
| Deletions | {{deletes}} |
| Replacements | {{replaces}} |
{{#each pages}}

## {{resource_type}} {{url}}{{#if status}} ({{status}}){{/if}}

{{#if operations}}
| Operation | Path | Old | New |
|---|---|---|---|
{{#each operations}}
| {{op}} | `{{path}}` | {{old}} | {{new}} |
{{/each}}
{{else}}
No changes.
{{/if}}
{{/each}}
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChangeLogFormat {
    #[default]
    Json,
    Markdown,
    Html,
}

impl FromStr for ChangeLogFormat {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ChangeLogFormat::Json),
            "markdown" | "md" => Ok(ChangeLogFormat::Markdown),
            "html" => Ok(ChangeLogFormat::Html),
            other => Err(ArtifactError::Validation(format!(
                "Invalid changelog format '{other}'. Valid values are json, markdown, html."
            ))),
        }
    }
}

/// Transport wrapper for a rendered changelog document.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    pub size: usize,
    /// Hex-encoded SHA-256 of `data`.
    pub hash: String,
    pub data: String,
}

impl Attachment {
    pub fn new(content_type: impl Into<String>, data: String) -> Self {
        let hash = hex::encode(Sha256::digest(data.as_bytes()));
        Self {
            content_type: content_type.into(),
            size: data.len(),
            hash,
            data,
        }
    }

    /// True when `hash` and `size` still describe `data`.
    pub fn verify(&self) -> bool {
        self.size == self.data.len() && self.hash == hex::encode(Sha256::digest(self.data.as_bytes()))
    }
}

#[derive(Serialize)]
struct TemplateOperation {
    op: String,
    path: String,
    old: String,
    new: String,
}

#[derive(Serialize)]
struct TemplatePage {
    resource_type: String,
    url: String,
    status: Option<String>,
    operations: Vec<TemplateOperation>,
}

#[derive(Serialize)]
struct TemplateContext<'a> {
    manifest_url: &'a str,
    source_version: Option<&'a str>,
    target_version: Option<&'a str>,
    inserts: usize,
    deletes: usize,
    replaces: usize,
    pages: Vec<TemplatePage>,
}

/// Renders [`ChangeLog`] documents as JSON, Markdown, or HTML.
pub struct ChangeLogRenderer {
    registry: Handlebars<'static>,
}

impl Default for ChangeLogRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeLogRenderer {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    pub fn render(&self, changelog: &ChangeLog, format: ChangeLogFormat) -> Result<String, ArtifactError> {
        match format {
            ChangeLogFormat::Json => Ok(serde_json::to_string_pretty(changelog)?),
            ChangeLogFormat::Markdown => self.markdown(changelog),
            ChangeLogFormat::Html => Ok(markdown::to_html_with_options(
                &self.markdown(changelog)?,
                &markdown::Options::gfm(),
            )
            .map_err(|err| ArtifactError::Template(err.to_string()))?),
        }
    }

    pub fn markdown(&self, changelog: &ChangeLog) -> Result<String, ArtifactError> {
        let context = TemplateContext {
            manifest_url: &changelog.manifest_url,
            source_version: changelog.source_version.as_deref(),
            target_version: changelog.target_version.as_deref(),
            inserts: changelog.count(DiffOperationType::Insert),
            deletes: changelog.count(DiffOperationType::Delete),
            replaces: changelog.count(DiffOperationType::Replace),
            pages: changelog.pages.iter().map(template_page).collect(),
        };
        self.registry
            .render_template(CHANGELOG_TEMPLATE, &context)
            .map_err(|err| ArtifactError::Template(err.to_string()))
    }

    /// JSON document wrapped with its size and digest.
    pub fn attachment(&self, changelog: &ChangeLog) -> Result<Attachment, ArtifactError> {
        let data = serde_json::to_string(changelog)?;
        Ok(Attachment::new("application/json", data))
    }
}

fn template_page(page: &Page) -> TemplatePage {
    let status = match (&page.old_data, &page.new_data) {
        (Some(_), None) => Some("removed".to_string()),
        (None, Some(_)) => Some("added".to_string()),
        _ => None,
    };
    TemplatePage {
        resource_type: page.resource_type.clone(),
        url: page.url.clone(),
        status,
        operations: page
            .operations
            .iter()
            .map(|op| TemplateOperation {
                op: op.op.to_string(),
                path: op.path.clone(),
                old: op.old_value.as_ref().map(cell).unwrap_or_default(),
                new: op.new_value.as_ref().map(cell).unwrap_or_default(),
            })
            .collect(),
    }
}

/// Table cell text; objects are summarized by their url.
fn cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.replace('|', "\\|"),
        serde_json::Value::Object(map) => map
            .get("url")
            .and_then(serde_json::Value::as_str)
            .map(|url| url.replace('|', "\\|"))
            .unwrap_or_else(|| "…".to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{DiffOperation, PageData, ValueSetSnapshot};
    use serde_json::json;

    fn changelog() -> ChangeLog {
        ChangeLog {
            manifest_url: "http://ex.org/Library/manifest".into(),
            source_version: Some("1.0.0".into()),
            target_version: Some("2.0.0".into()),
            pages: vec![
                Page {
                    url: "http://ex.org/Library/manifest".into(),
                    resource_type: "Library".into(),
                    old_data: None,
                    new_data: None,
                    operations: vec![DiffOperation {
                        op: DiffOperationType::Replace,
                        path: "/version".into(),
                        old_value: Some(json!("1.0.0")),
                        new_value: Some(json!("2.0.0")),
                    }],
                },
                Page {
                    url: "http://ex.org/ValueSet/leaf".into(),
                    resource_type: "ValueSet".into(),
                    old_data: None,
                    new_data: Some(PageData::ValueSet(ValueSetSnapshot::default())),
                    operations: vec![DiffOperation {
                        op: DiffOperationType::Insert,
                        path: "/codes/http://snomed.info/sct|123".into(),
                        old_value: None,
                        new_value: Some(json!("123")),
                    }],
                },
            ],
        }
    }

    #[test]
    fn markdown_lists_pages_and_totals() {
        let rendered = ChangeLogRenderer::new().markdown(&changelog()).unwrap();
        assert!(rendered.starts_with("# Changelog: http://ex.org/Library/manifest"));
        assert!(rendered.contains("Comparing version `1.0.0` to `2.0.0`."));
        assert!(rendered.contains("| Insertions | 1 |"));
        assert!(rendered.contains("## ValueSet http://ex.org/ValueSet/leaf (added)"));
        assert!(rendered.contains("| replace | `/version` | 1.0.0 | 2.0.0 |"));
    }

    #[test]
    fn html_renders_tables() {
        let html = ChangeLogRenderer::new()
            .render(&changelog(), ChangeLogFormat::Html)
            .unwrap();
        assert!(html.contains("<h1>"));
        assert!(html.contains("<table>"));
    }

    #[test]
    fn attachment_carries_digest_of_json() {
        let attachment = ChangeLogRenderer::new().attachment(&changelog()).unwrap();
        assert_eq!(attachment.content_type, "application/json");
        assert!(attachment.verify());
        let decoded: ChangeLog = serde_json::from_str(&attachment.data).unwrap();
        assert_eq!(decoded, changelog());
    }

    #[test]
    fn unknown_format_is_validation_error() {
        assert!(matches!(
            "pdf".parse::<ChangeLogFormat>(),
            Err(ArtifactError::Validation(_))
        ));
        assert_eq!("MD".parse::<ChangeLogFormat>().unwrap(), ChangeLogFormat::Markdown);
    }
}
