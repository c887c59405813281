//! Target platform description.

use serde::{Deserialize, Serialize};

/// The platform an operation executes for.
///
/// Part of every cache key: the same operation run for different platforms
/// must never share a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system, e.g. `"linux"`.
    pub os: String,
    /// CPU architecture, e.g. `"arm64"`.
    pub architecture: String,
    /// Architecture variant, e.g. `"v8"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// OS version constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Required OS features.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
            os_version: None,
            os_features: Vec::new(),
        }
    }

    #[must_use]
    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64")
    }

    #[must_use]
    pub fn linux_arm64() -> Self {
        Self::new("linux", "arm64")
    }

    /// Canonical JSON encoding used in cache digest derivation.
    ///
    /// Keys are emitted in sorted order (`arch`, `os`, `osFeatures`,
    /// `osVersion`, `variant`), `osFeatures` is sorted, and absent optional
    /// fields are omitted entirely rather than encoded as null. Hand-rolled
    /// so the byte output cannot drift with serializer settings.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        fn quote(s: &str) -> String {
            serde_json::to_string(s).expect("string serialization is infallible")
        }

        let mut fields: Vec<String> = Vec::with_capacity(5);
        fields.push(format!("\"arch\":{}", quote(&self.architecture)));
        fields.push(format!("\"os\":{}", quote(&self.os)));
        if !self.os_features.is_empty() {
            let mut features = self.os_features.clone();
            features.sort();
            let rendered: Vec<String> = features.iter().map(|f| quote(f)).collect();
            fields.push(format!("\"osFeatures\":[{}]", rendered.join(",")));
        }
        if let Some(version) = &self.os_version {
            fields.push(format!("\"osVersion\":{}", quote(version)));
        }
        if let Some(variant) = &self.variant {
            fields.push(format!("\"variant\":{}", quote(variant)));
        }
        format!("{{{}}}", fields.join(","))
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}
