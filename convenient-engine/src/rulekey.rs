//! Rule keys
//!
//! A rule key fingerprints everything that can influence a rule's outputs.
//! Fields are fed to SHA256 tagged and length-prefixed, so no two distinct
//! field sequences hash the same bytes, and every collection is visited in
//! sorted order so keys are independent of declaration order.
//!
//! Three flavours exist:
//! - the default key: configuration, all declared inputs, dependency keys
//! - the manifest key: configuration, dependency keys and only the inputs
//!   not covered by the dependency file; it locates a rule's manifest
//! - the dependency-file key: the manifest material plus the covered inputs
//!   a build actually read

use crate::hashing::FileHashLoader;
use crate::rules::{BuildRule, SupportsDependencyFileRuleKey};
use crate::target::BuildTarget;
use convenient_cache::{ContentHash, RuleKey};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

/// Bumped whenever key composition changes, invalidating all earlier keys
const RULE_KEY_VERSION: &str = "2";

const TAG_STR: u8 = b's';
const TAG_BOOL: u8 = b'b';
const TAG_U64: u8 = b'n';
const TAG_PATH: u8 = b'p';
const TAG_HASH: u8 = b'h';
const TAG_KEY: u8 = b'k';
const TAG_LIST: u8 = b'l';
const TAG_MAP: u8 = b'm';

/// Incremental builder of a [`RuleKey`]
pub struct RuleKeyBuilder {
    hasher: Sha256,
}

impl RuleKeyBuilder {
    fn with_kind(kind: &str) -> Self {
        let mut builder = Self { hasher: Sha256::new() };
        let _ = builder.set_str(".version", RULE_KEY_VERSION).set_str(".kind", kind);
        builder
    }

    /// A builder for ad-hoc keys
    #[must_use]
    pub fn new() -> Self {
        Self::with_kind("custom")
    }

    fn bytes(&mut self, value: &[u8]) {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
    }

    fn field(&mut self, tag: u8, name: &str) {
        self.hasher.update([tag]);
        self.bytes(name.as_bytes());
    }

    /// Add a string field
    pub fn set_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.field(TAG_STR, name);
        self.bytes(value.as_bytes());
        self
    }

    /// Add a boolean field
    pub fn set_bool(&mut self, name: &str, value: bool) -> &mut Self {
        self.field(TAG_BOOL, name);
        self.hasher.update([u8::from(value)]);
        self
    }

    /// Add an integer field
    pub fn set_u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.field(TAG_U64, name);
        self.hasher.update(value.to_le_bytes());
        self
    }

    /// Add a path by name only
    pub fn set_path(&mut self, name: &str, path: &Path) -> &mut Self {
        self.field(TAG_PATH, name);
        self.bytes(path_bytes(path).as_bytes());
        self
    }

    /// Add a file by name and content
    pub fn set_input(&mut self, name: &str, path: &Path, hash: &ContentHash) -> &mut Self {
        self.field(TAG_HASH, name);
        self.bytes(path_bytes(path).as_bytes());
        self.hasher.update(hash.as_bytes());
        self
    }

    /// Add another rule's key
    pub fn set_rule_key(&mut self, name: &str, key: &RuleKey) -> &mut Self {
        self.field(TAG_KEY, name);
        self.hasher.update(key.as_bytes());
        self
    }

    /// Add an ordered list of strings. Order is significant.
    pub fn set_strings<S: AsRef<str>>(&mut self, name: &str, values: &[S]) -> &mut Self {
        self.field(TAG_LIST, name);
        self.hasher.update((values.len() as u64).to_le_bytes());
        for value in values {
            self.bytes(value.as_ref().as_bytes());
        }
        self
    }

    /// Add a map, visited in key order
    pub fn set_map(&mut self, name: &str, values: &BTreeMap<String, String>) -> &mut Self {
        self.field(TAG_MAP, name);
        self.hasher.update((values.len() as u64).to_le_bytes());
        for (key, value) in values {
            self.bytes(key.as_bytes());
            self.bytes(value.as_bytes());
        }
        self
    }

    /// Finish the key
    #[must_use]
    pub fn build(self) -> RuleKey {
        RuleKey::from_digest(self.hasher.finalize().into())
    }
}

impl Default for RuleKeyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn path_bytes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Configuration, outputs and dependency keys: shared by every key flavour
fn append_rule_identity(builder: &mut RuleKeyBuilder, rule: &dyn BuildRule, dep_keys: &BTreeMap<BuildTarget, RuleKey>) {
    let _ = builder
        .set_str(".type", rule.rule_type())
        .set_str(".target", &rule.target().to_string());
    rule.append_to_rule_key(builder);

    let mut outputs: Vec<&PathBuf> = rule.outputs().iter().collect();
    outputs.sort();
    for output in outputs {
        let _ = builder.set_path(".out", output);
    }
    for (dep, key) in dep_keys {
        let _ = builder.set_rule_key(&dep.to_string(), key);
    }
}

fn sorted_inputs(rule: &dyn BuildRule) -> BTreeSet<&Path> {
    rule.inputs().iter().map(PathBuf::as_path).collect()
}

/// Computes default rule keys
pub struct DefaultRuleKeyFactory<'a> {
    hashes: &'a dyn FileHashLoader,
}

impl<'a> DefaultRuleKeyFactory<'a> {
    /// Factory hashing files through `hashes`
    pub fn new(hashes: &'a dyn FileHashLoader) -> Self {
        Self { hashes }
    }

    /// Key over the rule's configuration, all declared inputs and `dep_keys`
    ///
    /// # Errors
    ///
    /// If an input cannot be hashed
    pub fn build(&self, rule: &dyn BuildRule, dep_keys: &BTreeMap<BuildTarget, RuleKey>) -> io::Result<RuleKey> {
        let mut builder = RuleKeyBuilder::with_kind("default");
        append_rule_identity(&mut builder, rule, dep_keys);
        for input in sorted_inputs(rule) {
            let hash = self.hashes.get(input)?;
            let _ = builder.set_input(".in", input, &hash);
        }
        Ok(builder.build())
    }
}

/// A key together with the inputs it covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleKeyAndInputs {
    /// The key
    pub rule_key: RuleKey,
    /// For a manifest key: every input the dependency file may cover.
    /// For a dependency-file key: the covered inputs actually read.
    pub inputs: BTreeSet<PathBuf>,
}

/// Computes manifest and dependency-file keys
pub struct DepFileRuleKeyFactory<'a> {
    hashes: &'a dyn FileHashLoader,
}

impl<'a> DepFileRuleKeyFactory<'a> {
    /// Factory hashing files through `hashes`
    pub fn new(hashes: &'a dyn FileHashLoader) -> Self {
        Self { hashes }
    }

    fn support(rule: &dyn BuildRule) -> io::Result<&dyn SupportsDependencyFileRuleKey> {
        rule.dep_file_support().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} does not support dependency files", rule.target()),
            )
        })
    }

    /// Builder holding the identity plus every input *not* covered by the
    /// dependency file; returns the covered inputs alongside
    fn base(
        &self,
        kind: &str,
        rule: &dyn BuildRule,
        dep_keys: &BTreeMap<BuildTarget, RuleKey>,
    ) -> io::Result<(RuleKeyBuilder, BTreeSet<PathBuf>)> {
        let support = Self::support(rule)?;
        let mut builder = RuleKeyBuilder::with_kind(kind);
        append_rule_identity(&mut builder, rule, dep_keys);

        let mut covered = BTreeSet::new();
        for input in sorted_inputs(rule) {
            if support.covered_by_dep_file(input) {
                let _ = covered.insert(input.to_path_buf());
            } else {
                let hash = self.hashes.get(input)?;
                let _ = builder.set_input(".in", input, &hash);
            }
        }
        Ok((builder, covered))
    }

    /// Key locating the rule's manifest, independent of which covered inputs get read
    ///
    /// # Errors
    ///
    /// If the rule lacks dependency-file support or an input cannot be hashed
    pub fn build_manifest_key(
        &self,
        rule: &dyn BuildRule,
        dep_keys: &BTreeMap<BuildTarget, RuleKey>,
    ) -> io::Result<RuleKeyAndInputs> {
        let (builder, covered) = self.base("manifest", rule, dep_keys)?;
        Ok(RuleKeyAndInputs {
            rule_key: builder.build(),
            inputs: covered,
        })
    }

    /// Key over the manifest material plus the covered inputs in `used_inputs`.
    ///
    /// Used inputs that are not covered declared inputs are ignored.
    ///
    /// # Errors
    ///
    /// If the rule lacks dependency-file support or an input cannot be hashed
    pub fn build(
        &self,
        rule: &dyn BuildRule,
        dep_keys: &BTreeMap<BuildTarget, RuleKey>,
        used_inputs: &BTreeSet<PathBuf>,
    ) -> io::Result<RuleKeyAndInputs> {
        let (mut builder, covered) = self.base("depfile", rule, dep_keys)?;
        let used: BTreeSet<PathBuf> = covered.intersection(used_inputs).cloned().collect();
        for input in &used {
            let hash = self.hashes.get(input)?;
            let _ = builder.set_input(".used", input, &hash);
        }
        Ok(RuleKeyAndInputs {
            rule_key: builder.build(),
            inputs: used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::GenRule;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHashes(Mutex<HashMap<PathBuf, ContentHash>>);

    impl FakeHashes {
        fn set(&self, path: &str, content: &str) {
            let _ = self
                .0
                .lock()
                .unwrap()
                .insert(PathBuf::from(path), ContentHash::from_content(content.as_bytes()));
        }
    }

    impl FileHashLoader for FakeHashes {
        fn get(&self, path: &Path) -> io::Result<ContentHash> {
            self.0
                .lock()
                .unwrap()
                .get(path)
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
        }
    }

    fn genrule(srcs: &[&str], cmd: &str, dep_file: bool) -> GenRule {
        GenRule::new(
            BuildTarget::parse("//pkg:gen").unwrap(),
            srcs.iter().map(PathBuf::from).collect(),
            vec![PathBuf::from("out/gen.txt")],
            cmd,
        )
        .with_dep_file(dep_file)
    }

    fn hashes() -> FakeHashes {
        let hashes = FakeHashes::default();
        hashes.set("a.txt", "a");
        hashes.set("b.txt", "b");
        hashes
    }

    #[test]
    fn test_default_key_is_order_independent() {
        let hashes = hashes();
        let factory = DefaultRuleKeyFactory::new(&hashes);
        let one = factory.build(&genrule(&["a.txt", "b.txt"], "cat", false), &BTreeMap::new()).unwrap();
        let two = factory.build(&genrule(&["b.txt", "a.txt"], "cat", false), &BTreeMap::new()).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn test_default_key_tracks_content_config_and_deps() {
        let hashes = hashes();
        let rule = genrule(&["a.txt"], "cat", false);
        let base = DefaultRuleKeyFactory::new(&hashes).build(&rule, &BTreeMap::new()).unwrap();

        let other_cmd = DefaultRuleKeyFactory::new(&hashes)
            .build(&genrule(&["a.txt"], "tac", false), &BTreeMap::new())
            .unwrap();
        assert_ne!(base, other_cmd);

        let mut deps = BTreeMap::new();
        let _ = deps.insert(BuildTarget::parse("//d:d").unwrap(), RuleKey::from_digest([1; 32]));
        let with_dep = DefaultRuleKeyFactory::new(&hashes).build(&rule, &deps).unwrap();
        assert_ne!(base, with_dep);

        hashes.set("a.txt", "changed");
        let changed = DefaultRuleKeyFactory::new(&hashes).build(&rule, &BTreeMap::new()).unwrap();
        assert_ne!(base, changed);
    }

    #[test]
    fn test_field_boundaries_do_not_collide() {
        let mut a = RuleKeyBuilder::new();
        let _ = a.set_str("ab", "c");
        let mut b = RuleKeyBuilder::new();
        let _ = b.set_str("a", "bc");
        assert_ne!(a.build(), b.build());
    }

    #[test]
    fn test_manifest_key_ignores_covered_inputs() {
        let hashes = hashes();
        let rule = genrule(&["a.txt", "b.txt"], "cat", true);
        let factory = DepFileRuleKeyFactory::new(&hashes);

        let before = factory.build_manifest_key(&rule, &BTreeMap::new()).unwrap();
        hashes.set("b.txt", "edited");
        let after = factory.build_manifest_key(&rule, &BTreeMap::new()).unwrap();

        assert_eq!(before.rule_key, after.rule_key);
        assert_eq!(before.inputs.len(), 2);
    }

    #[test]
    fn test_dep_file_key_only_tracks_used_inputs() {
        let hashes = hashes();
        let rule = genrule(&["a.txt", "b.txt"], "cat", true);
        let factory = DepFileRuleKeyFactory::new(&hashes);
        let used: BTreeSet<PathBuf> = [PathBuf::from("a.txt"), PathBuf::from("undeclared.txt")].into();

        let first = factory.build(&rule, &BTreeMap::new(), &used).unwrap();
        assert_eq!(first.inputs, [PathBuf::from("a.txt")].into());

        hashes.set("b.txt", "edited");
        assert_eq!(factory.build(&rule, &BTreeMap::new(), &used).unwrap().rule_key, first.rule_key);

        hashes.set("a.txt", "edited");
        assert_ne!(factory.build(&rule, &BTreeMap::new(), &used).unwrap().rule_key, first.rule_key);
    }

    #[test]
    fn test_key_flavours_differ() {
        let hashes = hashes();
        let rule = genrule(&["a.txt"], "cat", true);
        let default = DefaultRuleKeyFactory::new(&hashes).build(&rule, &BTreeMap::new()).unwrap();
        let factory = DepFileRuleKeyFactory::new(&hashes);
        let manifest = factory.build_manifest_key(&rule, &BTreeMap::new()).unwrap().rule_key;
        let dep_file = factory
            .build(&rule, &BTreeMap::new(), &[PathBuf::from("a.txt")].into())
            .unwrap()
            .rule_key;
        assert_ne!(default, manifest);
        assert_ne!(default, dep_file);
        assert_ne!(manifest, dep_file);
    }

    #[test]
    fn test_unsupported_rule_is_rejected() {
        let hashes = hashes();
        let rule = genrule(&["a.txt"], "cat", false);
        let err = DepFileRuleKeyFactory::new(&hashes)
            .build_manifest_key(&rule, &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
