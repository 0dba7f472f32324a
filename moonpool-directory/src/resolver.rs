//! Maps grain types to the directory that serves them.
//!
//! Grain types are served by the default in-cluster partitioned directory
//! unless they declare a named pluggable directory. Declared names are
//! checked when the resolver is built, so a typo fails at startup, not on
//! the first call.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use moonpool_directory::{
//!     GrainDirectoryResolver, GrainType, InMemoryKeyValueStore, KeyValueGrainDirectory,
//!     PluggableGrainDirectory,
//! };
//!
//! let store = Arc::new(InMemoryKeyValueStore::new());
//! let kv = PluggableGrainDirectory::new(KeyValueGrainDirectory::new("cluster-1", store));
//!
//! let resolver = GrainDirectoryResolver::builder()
//!     .directory("kv", Arc::new(kv))
//!     .grain_type(GrainType::new("account"), "kv")
//!     .build()
//!     .expect("valid resolver config");
//!
//! assert!(resolver.resolve(&GrainType::new("account")).is_some());
//! assert!(resolver.resolve(&GrainType::new("user")).is_none());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::directory::GrainDirectory;
use crate::error::ConfigError;
use crate::model::GrainType;

/// Grain-type to directory routing table.
#[derive(Debug)]
pub struct GrainDirectoryResolver {
    directories: HashMap<String, Arc<dyn GrainDirectory>>,
    declared: HashMap<GrainType, String>,
    default_directory: Option<String>,
    resolved: DashMap<GrainType, Option<Arc<dyn GrainDirectory>>>,
}

impl GrainDirectoryResolver {
    /// Start building a resolver.
    pub fn builder() -> GrainDirectoryResolverBuilder {
        GrainDirectoryResolverBuilder::default()
    }

    /// A resolver that sends every grain type to the default directory.
    pub fn in_cluster_only() -> Self {
        Self {
            directories: HashMap::new(),
            declared: HashMap::new(),
            default_directory: None,
            resolved: DashMap::new(),
        }
    }

    /// The pluggable directory serving `grain_type`, or `None` when the
    /// default in-cluster directory serves it.
    ///
    /// The answer depends only on configuration and is memoized per type.
    pub fn resolve(&self, grain_type: &GrainType) -> Option<Arc<dyn GrainDirectory>> {
        if let Some(cached) = self.resolved.get(grain_type) {
            return cached.value().clone();
        }
        let name = self
            .declared
            .get(grain_type)
            .or(self.default_directory.as_ref());
        // Names were validated in build().
        let directory = name.and_then(|name| self.directories.get(name)).cloned();
        self.resolved
            .entry(grain_type.clone())
            .or_insert(directory)
            .value()
            .clone()
    }

    /// `true` when `grain_type` is served by the in-cluster directory.
    pub fn is_in_cluster(&self, grain_type: &GrainType) -> bool {
        self.resolve(grain_type).is_none()
    }

    /// Every registered pluggable directory, by name.
    pub fn directories(&self) -> impl Iterator<Item = (&str, &Arc<dyn GrainDirectory>)> {
        self.directories.iter().map(|(name, dir)| (name.as_str(), dir))
    }
}

/// Builder for [`GrainDirectoryResolver`].
#[derive(Debug, Default)]
pub struct GrainDirectoryResolverBuilder {
    directories: Vec<(String, Arc<dyn GrainDirectory>)>,
    declared: Vec<(GrainType, String)>,
    default_directory: Option<String>,
}

impl GrainDirectoryResolverBuilder {
    /// Register a named pluggable directory.
    pub fn directory(mut self, name: impl Into<String>, directory: Arc<dyn GrainDirectory>) -> Self {
        self.directories.push((name.into(), directory));
        self
    }

    /// Declare that `grain_type` is served by the directory called `name`.
    pub fn grain_type(mut self, grain_type: GrainType, name: impl Into<String>) -> Self {
        self.declared.push((grain_type, name.into()));
        self
    }

    /// Serve every undeclared grain type from the directory called `name`
    /// instead of the in-cluster directory.
    pub fn default_directory(mut self, name: impl Into<String>) -> Self {
        self.default_directory = Some(name.into());
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Every duplicate directory name and every reference to an unknown
    /// directory is reported; several problems come back together as
    /// [`ConfigError::Multiple`].
    pub fn build(self) -> Result<GrainDirectoryResolver, ConfigError> {
        let mut errors = Vec::new();

        let mut directories = HashMap::new();
        for (name, directory) in self.directories {
            if directories.insert(name.clone(), directory).is_some() {
                errors.push(ConfigError::DuplicateDirectory(name));
            }
        }

        let mut declared = HashMap::new();
        for (grain_type, name) in self.declared {
            if !directories.contains_key(&name) {
                errors.push(ConfigError::UnknownDirectory {
                    grain_type: grain_type.to_string(),
                    name: name.clone(),
                });
            }
            declared.insert(grain_type, name);
        }

        if let Some(name) = &self.default_directory {
            if !directories.contains_key(name) {
                errors.push(ConfigError::UnknownDirectory {
                    grain_type: "*".to_string(),
                    name: name.clone(),
                });
            }
        }

        ConfigError::from_list(errors)?;

        tracing::debug!(
            directories = directories.len(),
            declared = declared.len(),
            default = ?self.default_directory,
            "Resolver: built"
        );

        Ok(GrainDirectoryResolver {
            directories,
            declared,
            default_directory: self.default_directory,
            resolved: DashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::DirectoryPartition;

    fn dir() -> Arc<dyn GrainDirectory> {
        Arc::new(DirectoryPartition::new())
    }

    #[test]
    fn test_undeclared_type_uses_in_cluster() {
        let resolver = GrainDirectoryResolver::in_cluster_only();
        assert!(resolver.is_in_cluster(&GrainType::new("user")));
    }

    #[test]
    fn test_declared_type_resolves_to_named_directory() {
        let a = dir();
        let resolver = GrainDirectoryResolver::builder()
            .directory("a", Arc::clone(&a))
            .directory("b", dir())
            .grain_type(GrainType::new("account"), "a")
            .build()
            .expect("valid");

        let resolved = resolver.resolve(&GrainType::new("account")).expect("pluggable");
        assert!(Arc::ptr_eq(&resolved, &a));
        assert!(resolver.resolve(&GrainType::new("user")).is_none());

        let again = resolver.resolve(&GrainType::new("account")).expect("memoized");
        assert!(Arc::ptr_eq(&again, &a));
        assert_eq!(resolver.directories().count(), 2);
    }

    #[test]
    fn test_default_directory_override() {
        let a = dir();
        let resolver = GrainDirectoryResolver::builder()
            .directory("a", Arc::clone(&a))
            .default_directory("a")
            .build()
            .expect("valid");
        let resolved = resolver.resolve(&GrainType::new("anything")).expect("default");
        assert!(Arc::ptr_eq(&resolved, &a));
    }

    #[test]
    fn test_unknown_directory_fails_at_build() {
        let err = GrainDirectoryResolver::builder()
            .grain_type(GrainType::new("account"), "missing")
            .build()
            .expect_err("unknown name");
        assert_eq!(
            err,
            ConfigError::UnknownDirectory {
                grain_type: "account".into(),
                name: "missing".into(),
            }
        );
    }

    #[test]
    fn test_all_errors_reported() {
        let err = GrainDirectoryResolver::builder()
            .directory("a", dir())
            .directory("a", dir())
            .grain_type(GrainType::new("account"), "missing")
            .default_directory("also-missing")
            .build()
            .expect_err("three problems");
        match err {
            ConfigError::Multiple(errors) => assert_eq!(errors.len(), 3),
            other => panic!("expected Multiple, got {other:?}"),
        }
    }
}
