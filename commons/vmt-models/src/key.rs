use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("reference is empty")]
    Empty,
    #[error("reference '{0}' is not in namespace/name form")]
    Malformed(String),
    #[error("object has no name")]
    MissingName,
}

/// Namespaced identity of a stored object, rendered as `namespace/name`.
///
/// This is the form used by `spec.templateId` and `spec.defaultVersionId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a resource, falling back to `default` for objects that
    /// have not been assigned a namespace yet.
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let name = obj.meta().name.clone().ok_or(KeyError::MissingName)?;
        if name.is_empty() {
            return Err(KeyError::MissingName);
        }
        let namespace = obj.namespace().unwrap_or_else(|| "default".into());
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        match s.split_once('/') {
            Some((ns, name))
                if !ns.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(ns, name))
            }
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}
