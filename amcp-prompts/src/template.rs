//! Prompt templates with `{{variable}}` substitution.
//!
//! Variables are declared up front, either with a default value or as
//! required. A template referencing an undeclared variable is rejected at
//! build time, so typos surface immediately instead of rendering as holes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur during template operations.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// A required variable was not provided at render time.
    #[error("missing required variable: {name}")]
    MissingVariable {
        /// Name of the missing variable.
        name: String,
    },

    /// The template references a variable it never declared.
    #[error("template references undeclared variable: {name}")]
    UndeclaredVariable {
        /// Name of the undeclared variable.
        name: String,
    },
}

/// A prompt template with declared variables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptTemplate {
    template: String,
    defaults: HashMap<String, String>,
    required: Vec<String>,
}

impl PromptTemplate {
    /// Returns a builder for constructing templates.
    #[must_use]
    pub fn builder(template: impl Into<String>) -> TemplateBuilder {
        TemplateBuilder::new(template)
    }

    /// Renders the template using only declared defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::MissingVariable`] when a required variable
    /// has no value.
    pub fn render(&self) -> TemplateResult<String> {
        self.render_with(&HashMap::new())
    }

    /// Renders with additional runtime variables; runtime values override
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::MissingVariable`] when a required variable
    /// has no value.
    pub fn render_with(&self, runtime: &HashMap<String, String>) -> TemplateResult<String> {
        let mut result = self.template.clone();
        for name in extract_variable_refs(&self.template) {
            let value = runtime
                .get(&name)
                .or_else(|| self.defaults.get(&name))
                .map(String::as_str);
            let Some(value) = value else {
                return Err(TemplateError::MissingVariable { name });
            };
            let placeholder = format!("{{{{{name}}}}}");
            result = result.replace(&placeholder, value);
        }
        Ok(result)
    }

    /// Returns the raw template string.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Returns the names of required variables.
    #[must_use]
    pub fn required_variables(&self) -> &[String] {
        &self.required
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Builder for [`PromptTemplate`].
pub struct TemplateBuilder {
    template: String,
    defaults: HashMap<String, String>,
    required: Vec<String>,
}

impl TemplateBuilder {
    /// Creates a builder with the supplied template text.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            defaults: HashMap::new(),
            required: Vec::new(),
        }
    }

    /// Declares a variable with a default value.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.insert(name.into(), value.into());
        self
    }

    /// Declares a variable that must be supplied at render time.
    #[must_use]
    pub fn with_required_variable(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    /// Builds the template, verifying every referenced variable is declared.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::UndeclaredVariable`] when the template text
    /// references a variable that has neither a default nor a required
    /// declaration.
    pub fn build(self) -> TemplateResult<PromptTemplate> {
        for name in extract_variable_refs(&self.template) {
            if !self.defaults.contains_key(&name) && !self.required.contains(&name) {
                return Err(TemplateError::UndeclaredVariable { name });
            }
        }
        Ok(PromptTemplate {
            template: self.template,
            defaults: self.defaults,
            required: self.required,
        })
    }
}

/// Extracts `{{variable}}` references from a template string.
fn extract_variable_refs(template: &str) -> Vec<String> {
    let mut vars = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start + 2..].find("}}") else {
            break;
        };
        let name = rest[start + 2..start + 2 + end].trim();
        if !name.is_empty() && !vars.iter().any(|existing| existing == name) {
            vars.push(name.to_owned());
        }
        rest = &rest[start + 2 + end + 2..];
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_defaults() {
        let template = PromptTemplate::builder("You are {{role}}. {{task}}")
            .with_variable("role", "a planner")
            .with_variable("task", "Decompose the request.")
            .build()
            .unwrap();

        let rendered = template.render().unwrap();
        assert_eq!(rendered, "You are a planner. Decompose the request.");
    }

    #[test]
    fn runtime_variables_override_defaults() {
        let template = PromptTemplate::builder("Hello {{name}}!")
            .with_variable("name", "World")
            .build()
            .unwrap();

        let mut runtime = HashMap::new();
        runtime.insert("name".to_owned(), "Mesh".to_owned());
        assert_eq!(template.render_with(&runtime).unwrap(), "Hello Mesh!");
    }

    #[test]
    fn missing_required_variable_errors() {
        let template = PromptTemplate::builder("Query: {{query}}")
            .with_required_variable("query")
            .build()
            .unwrap();

        let err = template.render().expect_err("query not supplied");
        assert!(matches!(err, TemplateError::MissingVariable { .. }));
    }

    #[test]
    fn undeclared_reference_fails_at_build() {
        let err = PromptTemplate::builder("Hello {{nmae}}!")
            .with_required_variable("name")
            .build()
            .expect_err("typo must fail fast");
        assert!(matches!(err, TemplateError::UndeclaredVariable { .. }));
    }

    #[test]
    fn extracts_unique_refs_in_order() {
        let vars = extract_variable_refs("{{a}} {{b}} {{a}} {{ c }}");
        assert_eq!(vars, vec!["a", "b", "c"]);
    }

    #[test]
    fn repeated_variable_renders_everywhere() {
        let template = PromptTemplate::builder("{{x}} and {{x}}")
            .with_variable("x", "twice")
            .build()
            .unwrap();
        assert_eq!(template.render().unwrap(), "twice and twice");
    }
}
