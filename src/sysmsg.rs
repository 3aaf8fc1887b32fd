//! Externalized user-facing copy.
//!
//! Every handler fetches its reply text from this catalog by identifier, so
//! wording changes never touch the core logic. The default catalog is
//! compiled in; `MESSAGES_PATH` can point at an edited copy on disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::error::{Error, Result};

const EMBEDDED: &str = include_str!("messages.toml");

#[derive(Deserialize)]
struct Catalog {
    messages: HashMap<String, String>,
}

static DEFAULT: Lazy<Arc<HashMap<String, String>>> = Lazy::new(|| {
    let catalog: Catalog =
        toml::from_str(EMBEDDED).expect("embedded messages.toml must parse");
    Arc::new(catalog.messages)
});

/// Identifier -> template lookup. Cheap to clone; shared across requests.
#[derive(Clone)]
pub struct SystemMessages {
    inner: Arc<HashMap<String, String>>,
}

impl SystemMessages {
    /// The compiled-in catalog.
    pub fn embedded() -> Self {
        Self {
            inner: DEFAULT.clone(),
        }
    }

    /// Load a catalog from disk, e.g. for customized copy.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog: Catalog = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(Self {
            inner: Arc::new(catalog.messages),
        })
    }

    /// Template for `identifier`. A missing identifier is a deployment bug
    /// and surfaces as an internal error, not a user reply.
    pub fn get(&self, identifier: &str) -> Result<String> {
        self.inner
            .get(identifier)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("system message '{identifier}'")))
    }

    /// Fetch and substitute positional `{}` placeholders in one step.
    pub fn render(&self, identifier: &str, args: &[&str]) -> Result<String> {
        Ok(render(&self.get(identifier)?, args))
    }
}

/// Substitute each `{}` in order. Surplus placeholders are left as-is so a
/// template/caller mismatch is visible rather than silently dropped.
pub fn render(template: &str, args: &[&str]) -> String {
    let mut out = template.to_string();
    for arg in args {
        if let Some(pos) = out.find("{}") {
            out.replace_range(pos..pos + 2, arg);
        }
    }
    out
}
