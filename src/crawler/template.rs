use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid template {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} selector is empty")]
    MissingSelector(&'static str),

    #[error("XPath selectors are not supported: {0}")]
    XPath(String),

    #[error("invalid CSS selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    #[error("no fields could be extracted")]
    NothingExtracted,
}

/// Heuristic used by the extension that records templates
pub fn is_xpath(selector: &str) -> bool {
    let s = selector.trim_start();
    s.starts_with('/') || s.starts_with("(/") || s.starts_with("./")
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TemplateError> {
    if !path.exists() {
        return Err(TemplateError::NotFound(path.to_path_buf()));
    }

    let contents = fs::read_to_string(path).map_err(|source| TemplateError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&contents).map_err(|source| TemplateError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Listing page template: `{"itemSelector": ..., "nextPageSelector": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingTemplate {
    pub item_selector: String,
    #[serde(default)]
    pub next_page_selector: Option<String>,
}

impl ListingTemplate {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let template: Self = read_json(path)?;
        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.item_selector.trim().is_empty() {
            return Err(TemplateError::MissingSelector("item"));
        }
        if is_xpath(&self.item_selector) {
            return Err(TemplateError::XPath(self.item_selector.clone()));
        }
        if let Some(next) = self.next_selector() {
            if is_xpath(next) {
                return Err(TemplateError::XPath(next.to_string()));
            }
        }
        Ok(())
    }

    /// Next-page selector, if the template has a non-empty one
    pub fn next_selector(&self) -> Option<&str> {
        self.next_page_selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Attribute,
    Html,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub selector: String,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub multiple: bool,
}

impl FieldSpec {
    pub fn is_image(&self) -> bool {
        self.kind == FieldKind::Image || self.name.eq_ignore_ascii_case("img")
    }
}

/// Detail page template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailTemplate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_selector: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Clicked after load, e.g. "show phone" buttons
    #[serde(default)]
    pub reveal_selectors: Vec<String>,
}

impl DetailTemplate {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let template: Self = read_json(path)?;
        if let Some(base) = template.base_selector.as_deref() {
            if is_xpath(base) {
                return Err(TemplateError::XPath(base.to_string()));
            }
        }
        Ok(template)
    }
}
