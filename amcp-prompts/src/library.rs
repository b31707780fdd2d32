//! Versioned registry of named prompt templates.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::template::PromptTemplate;

/// Identifies a template by name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    name: String,
    version: u32,
}

impl TemplateKey {
    /// Creates a key from a template name and version.
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Returns the template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the template version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }
}

/// Thread-safe library of versioned prompt templates.
///
/// Callers pin a `(name, version)` pair; `latest` exists for tooling that
/// always wants the newest revision.
#[derive(Default)]
pub struct PromptLibrary {
    templates: RwLock<HashMap<TemplateKey, PromptTemplate>>,
}

impl PromptLibrary {
    /// Creates an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a template under the given key.
    pub fn insert(&self, key: TemplateKey, template: PromptTemplate) {
        debug!(name = key.name(), version = key.version(), "template installed");
        self.templates
            .write()
            .expect("template library lock poisoned")
            .insert(key, template);
    }

    /// Fetches the template for an exact `(name, version)` pair.
    #[must_use]
    pub fn get(&self, name: &str, version: u32) -> Option<PromptTemplate> {
        self.templates
            .read()
            .expect("template library lock poisoned")
            .get(&TemplateKey::new(name, version))
            .cloned()
    }

    /// Fetches the highest-versioned template with the given name.
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<PromptTemplate> {
        let templates = self
            .templates
            .read()
            .expect("template library lock poisoned");
        templates
            .iter()
            .filter(|(key, _)| key.name() == name)
            .max_by_key(|(key, _)| key.version())
            .map(|(_, template)| template.clone())
    }

    /// Returns the number of installed templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates
            .read()
            .expect("template library lock poisoned")
            .len()
    }

    /// Returns `true` when the library holds no templates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(text: &str) -> PromptTemplate {
        PromptTemplate::builder(text).build().unwrap()
    }

    #[test]
    fn exact_and_latest_lookup() {
        let library = PromptLibrary::new();
        library.insert(TemplateKey::new("planner", 1), template("v1"));
        library.insert(TemplateKey::new("planner", 2), template("v2"));
        library.insert(TemplateKey::new("synthesis", 1), template("s1"));

        assert_eq!(library.get("planner", 1).unwrap().template(), "v1");
        assert_eq!(library.latest("planner").unwrap().template(), "v2");
        assert_eq!(library.latest("synthesis").unwrap().template(), "s1");
        assert!(library.get("planner", 3).is_none());
        assert!(library.latest("missing").is_none());
        assert_eq!(library.len(), 3);
    }
}
