//! Task template rendering

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use handlebars::Handlebars;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Failed to render {name}: {message}")]
    Render { name: String, message: String },
}

/// Renders a named template with resolved task parameters
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, parameters: &BTreeMap<String, String>) -> Result<Vec<u8>, RenderError>;
}

/// Handlebars templates keyed by file name, e.g. `img.js`
///
/// Output is not HTML-escaped: templates produce JavaScript as well as HTML.
pub struct HandlebarsRenderer {
    hbs: Handlebars<'static>,
}

impl Default for HandlebarsRenderer {
    fn default() -> Self {
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        Self { hbs }
    }
}

impl HandlebarsRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every regular file in `dir` under its file name
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(dir = %dir.display(), "HandlebarsRenderer::from_directory: called");
        let mut renderer = Self::new();
        let entries = fs::read_dir(dir).wrap_err_with(|| format!("Failed to read templates from {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let content =
                fs::read_to_string(&path).wrap_err_with(|| format!("Failed to read template {}", path.display()))?;
            renderer.register(name, &content)?;
        }
        info!(dir = %dir.display(), count = renderer.hbs.get_templates().len(), "Templates loaded");
        Ok(renderer)
    }

    pub fn register(&mut self, name: &str, content: &str) -> Result<()> {
        debug!(%name, "HandlebarsRenderer::register: called");
        self.hbs
            .register_template_string(name, content)
            .wrap_err_with(|| format!("Invalid template {name}"))
    }
}

impl TemplateRenderer for HandlebarsRenderer {
    fn render(&self, name: &str, parameters: &BTreeMap<String, String>) -> Result<Vec<u8>, RenderError> {
        if !self.hbs.has_template(name) {
            return Err(RenderError::NotFound(name.to_string()));
        }
        self.hbs
            .render(name, parameters)
            .map(String::into_bytes)
            .map_err(|e| RenderError::Render {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parameters() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("serverUrl".to_string(), "http://localhost:8080".to_string()),
            ("url".to_string(), "http://a.example/x.png?a=1&b=2".to_string()),
        ])
    }

    #[test]
    fn test_render_does_not_escape() {
        let mut renderer = HandlebarsRenderer::new();
        renderer
            .register("img.js", "load(\"{{url}}\", \"{{serverUrl}}/submit\");")
            .unwrap();

        let body = renderer.render("img.js", &parameters()).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "load(\"http://a.example/x.png?a=1&b=2\", \"http://localhost:8080/submit\");"
        );
    }

    #[test]
    fn test_missing_template() {
        let renderer = HandlebarsRenderer::new();
        assert_eq!(
            renderer.render("iframe.html", &parameters()),
            Err(RenderError::NotFound("iframe.html".to_string()))
        );
    }

    #[test]
    fn test_from_directory() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("img.html"), "<img src=\"{{url}}\">").unwrap();
        fs::write(temp.path().join("img.js"), "// {{url}}").unwrap();
        fs::create_dir(temp.path().join("nested")).unwrap();

        let renderer = HandlebarsRenderer::from_directory(temp.path()).unwrap();
        assert!(renderer.render("img.html", &parameters()).is_ok());
        assert!(renderer.render("img.js", &parameters()).is_ok());
        assert!(renderer.render("nested", &parameters()).is_err());
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        let mut renderer = HandlebarsRenderer::new();
        assert!(renderer.register("bad.js", "{{#if}}").is_err());
    }

    #[test]
    fn test_bundled_templates() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../task-templates");
        let renderer = HandlebarsRenderer::from_directory(dir).unwrap();

        let mut params = parameters();
        params.insert("measurementId".to_string(), "00000000000000ff".to_string());
        params.insert("hintShowStats".to_string(), "true".to_string());
        params.insert("hintJQueryAlreadyLoaded".to_string(), "true".to_string());
        params.insert("count".to_string(), "7".to_string());

        let js = String::from_utf8(renderer.render("img.js", &params).unwrap()).unwrap();
        assert!(js.contains("encodeURIComponent(\"00000000000000ff\")"));
        assert!(js.contains("img.attr('src', 'http://a.example/x.png?a=1&b=2')"));
        assert!(js.contains("performed 7 measurements"));
        assert!(!js.contains("loadJQuery"));

        params.insert("hintShowStats".to_string(), "false".to_string());
        let html = String::from_utf8(renderer.render("img.html", &params).unwrap()).unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(!html.contains("setupStats"));
    }

    #[test]
    fn test_bundled_templates_cover_every_task_type() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../task-templates");
        let renderer = HandlebarsRenderer::from_directory(dir).unwrap();

        let mut params = parameters();
        params.insert("measurementId".to_string(), "00000000000000ff".to_string());
        params.insert("count".to_string(), "0".to_string());
        params.insert("cssId".to_string(), "exp-span".to_string());
        params.insert("cssAttribute".to_string(), "position".to_string());
        params.insert("cssDesiredValue".to_string(), "absolute".to_string());
        params.insert("imageUrl".to_string(), "http://a.example/cached.png".to_string());

        for task_type in ["img", "script", "css", "iframe-cache", "iframe-load"] {
            for substrate in [".js", ".html"] {
                let name = format!("{task_type}{substrate}");
                let body = renderer.render(&name, &params).unwrap_or_else(|e| panic!("{name}: {e}"));
                let body = String::from_utf8(body).unwrap();
                assert!(body.contains("CensorshipMeter.measure = function()"), "{name}");
                assert!(body.contains("http://a.example/x.png?a=1&b=2"), "{name}");
            }
        }

        let css = String::from_utf8(renderer.render("css.js", &params).unwrap()).unwrap();
        assert!(css.contains("getPropertyValue('position') == 'absolute'"));
        assert!(!css.contains("success-control"));

        params.insert("controlCssId".to_string(), "control-span".to_string());
        let css = String::from_utf8(renderer.render("css.js", &params).unwrap()).unwrap();
        assert!(css.contains("<span id=\"control-span\"></span>"));
        assert!(css.contains("success-control"));

        let cache = String::from_utf8(renderer.render("iframe-cache.js", &params).unwrap()).unwrap();
        assert!(cache.contains("img.attr('src', 'http://a.example/cached.png')"));
    }
}
