//! Where templates come from.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

use devbox_core::{ProvisionError, Result};
use tracing::debug;

use crate::model::Template;

/// Resolves template ids to templates.
pub trait TemplateCatalog: Send + Sync {
    fn load_template(&self, id: &str) -> Result<Template>;
}

fn check_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(ProvisionError::InvalidInput(format!(
            "Invalid template id: '{}'",
            id
        )));
    }
    Ok(())
}

/// Templates stored as `<dir>/<id>.yaml` (or `.yml`).
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dir: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TemplateCatalog for DirectoryCatalog {
    fn load_template(&self, id: &str) -> Result<Template> {
        check_id(id)?;
        for ext in ["yaml", "yml"] {
            let path = self.dir.join(format!("{}.{}", id, ext));
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            debug!(path = %path.display(), "Loading template");
            let template = Template::from_yaml(&content).map_err(|e| {
                ProvisionError::Serialization(format!("{}: {}", path.display(), e))
            })?;
            if template.id != id {
                return Err(ProvisionError::InvalidInput(format!(
                    "{} declares id '{}', expected '{}'",
                    path.display(),
                    template.id,
                    id
                )));
            }
            return Ok(template);
        }
        Err(ProvisionError::TemplateNotFound(id.to_string()))
    }
}

/// Templates registered in memory.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    templates: RwLock<HashMap<String, Template>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(self, template: Template) -> Self {
        self.insert(template);
        self
    }

    pub fn insert(&self, template: Template) {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        templates.insert(template.id.clone(), template);
    }
}

impl TemplateCatalog for InMemoryCatalog {
    fn load_template(&self, id: &str) -> Result<Template> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        templates
            .get(id)
            .cloned()
            .ok_or_else(|| ProvisionError::TemplateNotFound(id.to_string()))
    }
}
