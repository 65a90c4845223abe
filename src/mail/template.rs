//! Template boundary: subject/body text may be produced by a rendering
//! collaborator. The pipeline treats whatever comes back as opaque text.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Renders a named template against a context mapping.
pub trait TemplateRenderer {
    /// Render `<name>.<ext>`; `Ok(None)` when the template does not exist.
    fn render(
        &self,
        name: &str,
        ext: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<Option<String>>;
}

/// File-backed renderer: reads `<root>/<name>.<ext>` and substitutes
/// `{{ key }}` placeholders from the context.
#[derive(Debug, Clone)]
pub struct DirTemplates {
    root: PathBuf,
}

impl DirTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TemplateRenderer for DirTemplates {
    fn render(
        &self,
        name: &str,
        ext: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        let path = self.root.join(format!("{}.{}", name, ext));
        if !path.exists() {
            return Ok(None);
        }
        let mut text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading template {}", path.display()))?;
        for (key, value) in context {
            text = text.replace(&format!("{{{{ {} }}}}", key), value);
            text = text.replace(&format!("{{{{{}}}}}", key), value);
        }
        Ok(Some(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn renders_both_extensions_with_context() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("welcome.txt"), "Hi {{ name }}!")?;
        std::fs::write(dir.path().join("welcome.html"), "<b>Hi {{ name }}!</b>")?;

        let templates = DirTemplates::new(dir.path());
        let mut context = BTreeMap::new();
        context.insert("name".to_string(), "Ada".to_string());

        assert_eq!(
            templates.render("welcome", "txt", &context)?,
            Some("Hi Ada!".to_string())
        );
        assert_eq!(
            templates.render("welcome", "html", &context)?,
            Some("<b>Hi Ada!</b>".to_string())
        );
        assert_eq!(templates.render("missing", "txt", &context)?, None);
        Ok(())
    }
}
