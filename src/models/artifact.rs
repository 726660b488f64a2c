use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PipelineError;

/// Opaque handle to bytes held by an artifact store.
///
/// Refs are 32 lowercase hex characters (a v7 UUID without hyphens), which
/// keeps them safe to use as file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let valid = raw.len() == 32
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(PipelineError::Validation(format!(
                "'{}' is not a valid artifact reference",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
