//! Versioned cache names and cleanup of old generations.

use std::fmt;

use crate::config::CachesConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
  /// Precached shell and cache-first assets
  Static,
  /// Pages and anything served stale-while-revalidate
  Runtime,
  /// API responses (network-first)
  Data,
}

impl CacheCategory {
  pub const ALL: [CacheCategory; 3] = [
    CacheCategory::Static,
    CacheCategory::Runtime,
    CacheCategory::Data,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      CacheCategory::Static => "static",
      CacheCategory::Runtime => "runtime",
      CacheCategory::Data => "data",
    }
  }

  fn from_str(s: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|c| c.as_str() == s)
  }
}

/// One named cache: `{prefix}-{category}-v{version}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  pub prefix: String,
  pub category: CacheCategory,
  pub version: u32,
}

impl CacheGeneration {
  pub fn name(&self) -> String {
    format!("{}-{}-v{}", self.prefix, self.category.as_str(), self.version)
  }

  /// Parse a cache name. Names that don't follow the scheme return `None`.
  pub fn parse(name: &str) -> Option<Self> {
    let (rest, version) = name.rsplit_once("-v")?;
    let version = version.parse().ok()?;
    let (prefix, category) = rest.rsplit_once('-')?;
    let category = CacheCategory::from_str(category)?;
    if prefix.is_empty() {
      return None;
    }
    Some(Self {
      prefix: prefix.to_string(),
      category,
      version,
    })
  }
}

impl fmt::Display for CacheGeneration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name())
  }
}

/// The three cache names in use by the current deploy.
#[derive(Debug, Clone)]
pub struct CacheNames {
  prefix: String,
  static_version: u32,
  runtime_version: u32,
  data_version: u32,
}

/// What activation should do with an existing cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
  Keep,
  /// Older than the current version of its category
  DeleteOutdated,
  /// Newer than the current version (a rollback deploy)
  DeleteNewer,
}

impl CacheNames {
  pub fn from_config(config: &CachesConfig) -> Self {
    Self {
      prefix: config.prefix.clone(),
      static_version: config.static_assets,
      runtime_version: config.runtime,
      data_version: config.data,
    }
  }

  pub fn current(&self, category: CacheCategory) -> CacheGeneration {
    let version = match category {
      CacheCategory::Static => self.static_version,
      CacheCategory::Runtime => self.runtime_version,
      CacheCategory::Data => self.data_version,
    };
    CacheGeneration {
      prefix: self.prefix.clone(),
      category,
      version,
    }
  }

  pub fn static_assets(&self) -> String {
    self.current(CacheCategory::Static).name()
  }

  pub fn runtime(&self) -> String {
    self.current(CacheCategory::Runtime).name()
  }

  pub fn data(&self) -> String {
    self.current(CacheCategory::Data).name()
  }

  /// Decide the fate of an existing cache by comparing its version with the
  /// current one. Caches that aren't ours are kept.
  pub fn cleanup_for(&self, name: &str) -> Cleanup {
    let Some(generation) = CacheGeneration::parse(name) else {
      return Cleanup::Keep;
    };
    if generation.prefix != self.prefix {
      return Cleanup::Keep;
    }

    let current = self.current(generation.category).version;
    match generation.version.cmp(&current) {
      std::cmp::Ordering::Equal => Cleanup::Keep,
      std::cmp::Ordering::Less => Cleanup::DeleteOutdated,
      std::cmp::Ordering::Greater => Cleanup::DeleteNewer,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn names(static_assets: u32, runtime: u32, data: u32) -> CacheNames {
    CacheNames::from_config(&CachesConfig {
      prefix: "erp".to_string(),
      static_assets,
      runtime,
      data,
    })
  }

  #[test]
  fn test_parse_roundtrip() {
    let generation = CacheGeneration::parse("erp-static-v3").unwrap();
    assert_eq!(generation.category, CacheCategory::Static);
    assert_eq!(generation.version, 3);
    assert_eq!(generation.name(), "erp-static-v3");
  }

  #[test]
  fn test_parse_prefix_with_dashes() {
    let generation = CacheGeneration::parse("erp-pos-data-v12").unwrap();
    assert_eq!(generation.prefix, "erp-pos");
    assert_eq!(generation.category, CacheCategory::Data);
    assert_eq!(generation.version, 12);
  }

  #[test]
  fn test_parse_rejects_foreign_names() {
    assert!(CacheGeneration::parse("workbox-precache").is_none());
    assert!(CacheGeneration::parse("erp-images-v1").is_none());
    assert!(CacheGeneration::parse("erp-static-vx").is_none());
  }

  #[test]
  fn test_cleanup_compares_versions_per_category() {
    let names = names(2, 1, 3);
    assert_eq!(names.cleanup_for("erp-static-v2"), Cleanup::Keep);
    assert_eq!(names.cleanup_for("erp-static-v1"), Cleanup::DeleteOutdated);
    assert_eq!(names.cleanup_for("erp-runtime-v1"), Cleanup::Keep);
    assert_eq!(names.cleanup_for("erp-data-v4"), Cleanup::DeleteNewer);
    assert_eq!(names.cleanup_for("other-static-v1"), Cleanup::Keep);
  }
}
