//! Prompt templates for the AMCP orchestration layer.

#![warn(missing_docs, clippy::pedantic)]

mod library;
mod template;

/// Versioned template registry.
pub use library::{PromptLibrary, TemplateKey};
/// Template type, builder, and errors.
pub use template::{PromptTemplate, TemplateBuilder, TemplateError, TemplateResult};
