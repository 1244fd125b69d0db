//! Type registry
//!
//! Resource types are registered up front by the host application.
//! Nothing is loaded dynamically; an unregistered name simply fails to resolve.

use crate::model::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A resource type and the attribute names it declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Fully-qualified name, e.g. `app.Doc`
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeSet<String>,
}

impl TypeDescriptor {
    pub fn new<I, S>(name: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn attribute_names(&self) -> &BTreeSet<String> {
        &self.attributes
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains(name)
    }
}

/// Split `module.path.Type` at the last dot.
///
/// Both halves must be non-empty.
pub fn split_qualified_name(name: &str) -> Result<(&str, &str), ModelError> {
    match name.rsplit_once('.') {
        Some((module, type_name)) if !module.is_empty() && !type_name.is_empty() => {
            Ok((module, type_name))
        }
        _ => Err(ModelError::InvalidModelName(name.to_string())),
    }
}

/// Resolves fully-qualified type names to descriptors
pub trait TypeRegistry: Send + Sync {
    fn resolve(&self, qualified_name: &str) -> Result<Arc<TypeDescriptor>, ModelError>;
}

/// Registry populated once at startup
#[derive(Debug, Clone, Default)]
pub struct StaticTypeRegistry {
    types: HashMap<String, Arc<TypeDescriptor>>,
}

impl StaticTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = TypeDescriptor>,
    ) -> Result<Self, ModelError> {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Register a type, replacing any previous descriptor with the same name
    pub fn register(&mut self, descriptor: TypeDescriptor) -> Result<&mut Self, ModelError> {
        split_qualified_name(&descriptor.name)?;
        tracing::debug!(
            type_name = %descriptor.name,
            attributes = descriptor.attributes.len(),
            "registered resource type"
        );
        self.types
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Registered descriptors sorted by name
    pub fn descriptors(&self) -> Vec<Arc<TypeDescriptor>> {
        let mut all: Vec<_> = self.types.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl TypeRegistry for StaticTypeRegistry {
    fn resolve(&self, qualified_name: &str) -> Result<Arc<TypeDescriptor>, ModelError> {
        split_qualified_name(qualified_name)?;
        self.types
            .get(qualified_name)
            .cloned()
            .ok_or_else(|| ModelError::InvalidModelName(qualified_name.to_string()))
    }
}
