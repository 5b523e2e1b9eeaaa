//! `{placeholder}` URI templates used to derive the externally visible path of
//! a discovered service, e.g. `/bar/{version}{contextPath}/`.
use std::{collections::HashMap, fmt};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.-]*)\}").expect("valid regex"));

static REPEATED_SLASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"/{2,}").expect("valid regex"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("URI template must start with '/': {0}")]
    NotAbsolute(String),

    #[error("URI template has unbalanced braces: {0}")]
    UnbalancedBraces(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    template: String,
    parameters: Vec<String>,
}

impl UriTemplate {
    pub fn new(template: &str) -> Result<Self, TemplateError> {
        if !template.starts_with('/') && !template.starts_with('{') {
            return Err(TemplateError::NotAbsolute(template.to_string()));
        }

        // anything left after removing valid placeholders must be brace-free
        let stripped = PLACEHOLDER.replace_all(template, "");
        if stripped.contains('{') || stripped.contains('}') {
            return Err(TemplateError::UnbalancedBraces(template.to_string()));
        }

        let parameters = PLACEHOLDER
            .captures_iter(template)
            .map(|caps| caps[1].to_string())
            .collect();

        Ok(Self {
            template: template.to_string(),
            parameters,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Placeholder names in template order.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.iter().any(|param| param == name)
    }

    /// Substitute every placeholder. Unknown placeholders bind to the empty
    /// string and runs of `/` produced by empty values collapse to one.
    pub fn bind(&self, params: &HashMap<String, String>) -> String {
        let bound = PLACEHOLDER.replace_all(&self.template, |caps: &regex::Captures<'_>| {
            params.get(&caps[1]).cloned().unwrap_or_default()
        });
        let mut path = REPEATED_SLASHES.replace_all(&bound, "/").into_owned();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        path
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}
