//! User-data rendering hook.
//!
//! Clusters pass every user-data template through a [`UserDataRenderer`]
//! before creating a server. The default [`PlaceholderRenderer`] substitutes
//! well-known tokens such as `$public_ipv4` with the provider's metadata
//! expressions, verbatim.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors raised while rendering user-data.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RenderError {
    /// Raised when the template is empty or only whitespace.
    #[error("user-data template must not be empty")]
    EmptyTemplate,
    /// Raised when a renderer rejects the template.
    #[error("invalid user-data template: {0}")]
    Invalid(String),
}

/// Renders a user-data template with provider placeholders.
pub trait UserDataRenderer: Send + Sync {
    /// Substitutes `placeholders` into `template`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError`] when the template cannot be rendered.
    fn render(
        &self,
        template: &str,
        placeholders: &BTreeMap<String, String>,
    ) -> Result<String, RenderError>;
}

/// Plain token substitution.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaceholderRenderer;

impl UserDataRenderer for PlaceholderRenderer {
    fn render(
        &self,
        template: &str,
        placeholders: &BTreeMap<String, String>,
    ) -> Result<String, RenderError> {
        if template.trim().is_empty() {
            return Err(RenderError::EmptyTemplate);
        }
        // Longest tokens first so `$public_ipv4` is not clobbered by a
        // shorter token that happens to be its prefix.
        let mut tokens: Vec<_> = placeholders.iter().collect();
        tokens.sort_by(|lhs, rhs| rhs.0.len().cmp(&lhs.0.len()));
        let mut rendered = template.to_owned();
        for (token, expression) in tokens {
            rendered = rendered.replace(token.as_str(), expression);
        }
        Ok(rendered)
    }
}
