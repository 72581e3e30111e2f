//! Build targets and the on-disk layout derived from them

use crate::error::BuildError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Fully qualified target name, `//package/path:name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildTarget {
    package: String,
    name: String,
}

impl BuildTarget {
    /// Parse `//package:name`
    ///
    /// # Errors
    ///
    /// `BuildError::InvalidTarget` on anything else
    pub fn parse(text: &str) -> Result<Self, BuildError> {
        let invalid = || BuildError::InvalidTarget(text.to_string());
        let rest = text.strip_prefix("//").ok_or_else(invalid)?;
        let (package, name) = rest.split_once(':').ok_or_else(invalid)?;
        if name.is_empty()
            || name.contains(['/', ':'])
            || package.split('/').any(|part| part == ".." || part == ".")
            || package.starts_with('/')
        {
            return Err(invalid());
        }
        Ok(Self {
            package: package.to_string(),
            name: name.to_string(),
        })
    }

    /// Package path
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Short name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Relative path unique to this target, usable as a directory name
    #[must_use]
    pub fn path_component(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for part in self.package.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path.push(format!("__{}__", self.name));
        path
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}", self.package, self.name)
    }
}

impl FromStr for BuildTarget {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, BuildError> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BuildTarget {
    type Error = BuildError;

    fn try_from(value: String) -> Result<Self, BuildError> {
        Self::parse(&value)
    }
}

impl From<BuildTarget> for String {
    fn from(value: BuildTarget) -> Self {
        value.to_string()
    }
}

/// Locations of everything the engine writes
#[derive(Debug, Clone)]
pub struct BuildPaths {
    project_root: PathBuf,
    out_root: PathBuf,
}

/// Name of the manifest file inside a rule's metadata directory
pub const MANIFEST: &str = "manifest";

const RULE_KEY: &str = "rule_key";
const DEP_FILE: &str = "depfile";

impl BuildPaths {
    /// Layout rooted at `project_root` with outputs under `out_dir`
    pub fn new(project_root: impl Into<PathBuf>, out_dir: &Path) -> Self {
        let project_root = project_root.into();
        let out_root = project_root.join(out_dir);
        Self {
            project_root,
            out_root,
        }
    }

    /// Root of the project; rule inputs and outputs are relative to it
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Root of the managed output tree
    #[must_use]
    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    /// Private metadata directory of a rule
    #[must_use]
    pub fn metadata_dir(&self, target: &BuildTarget) -> PathBuf {
        self.out_root.join("meta").join(target.path_component())
    }

    /// Scratch directory of a rule, wiped before it builds
    #[must_use]
    pub fn scratch_dir(&self, target: &BuildTarget) -> PathBuf {
        self.out_root.join("tmp").join(target.path_component())
    }

    /// Where a rule's manifest lives
    #[must_use]
    pub fn manifest_path(&self, target: &BuildTarget) -> PathBuf {
        self.metadata_dir(target).join(MANIFEST)
    }

    /// Where the key of a rule's last successful build is recorded
    #[must_use]
    pub fn rule_key_path(&self, target: &BuildTarget) -> PathBuf {
        self.metadata_dir(target).join(RULE_KEY)
    }

    /// Where a rule writes the list of inputs it actually read
    #[must_use]
    pub fn dep_file_path(&self, target: &BuildTarget) -> PathBuf {
        self.metadata_dir(target).join(DEP_FILE)
    }

    /// Scratch space of persistent worker processes
    #[must_use]
    pub fn worker_dir(&self) -> PathBuf {
        self.out_root.join("workers")
    }

    /// Resolve a project-relative path
    #[must_use]
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.project_root.join(relative)
    }
}
