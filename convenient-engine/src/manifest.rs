//! Dependency-file manifests
//!
//! A manifest belongs to one rule and is addressed by the rule's manifest
//! key. Each entry remembers the output key of an earlier build together with
//! the content hashes of the inputs that build actually read. A later build
//! whose tracked inputs still hash the same can reuse that output even when
//! other declared inputs changed.
//!
//! Input paths and `(input, hash)` pairs are interned in tables so entries
//! sharing inputs stay small. On disk a manifest is two CBOR items: a header
//! carrying [`MANIFEST_VERSION`] and the body.

use crate::error::ManifestError;
use crate::hashing::FileHashLoader;
use convenient_cache::{ContentHash, RuleKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Format version written into every manifest header
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Header {
    version: u32,
}

/// Size summary of a manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStats {
    /// Number of entries
    pub entries: usize,
    /// Distinct input paths
    pub inputs: usize,
    /// Distinct `(input, hash)` pairs
    pub hashes: usize,
}

/// Per-rule record of output keys and the input hashes they were built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    key: RuleKey,
    inputs: Vec<String>,
    /// `(index into inputs, hash)`
    hashes: Vec<(u32, ContentHash)>,
    /// `(output key, indices into hashes)`
    entries: Vec<(RuleKey, Vec<u32>)>,
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn table_index(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| io::Error::other("manifest table overflow"))
}

impl Manifest {
    /// Empty manifest for `key`
    #[must_use]
    pub fn new(key: RuleKey) -> Self {
        Self {
            key,
            inputs: Vec::new(),
            hashes: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Manifest key this manifest was created for
    #[must_use]
    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    /// Number of entries
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Table sizes
    #[must_use]
    pub fn stats(&self) -> ManifestStats {
        ManifestStats {
            entries: self.entries.len(),
            inputs: self.inputs.len(),
            hashes: self.hashes.len(),
        }
    }

    /// Record that `output_key` was built from `used_inputs`.
    ///
    /// Only inputs inside `universe` (the rule's dependency-file covered
    /// inputs) are tracked. An existing entry for the same output key is
    /// replaced.
    ///
    /// # Errors
    ///
    /// If a used input cannot be hashed
    pub fn add_entry(
        &mut self,
        hashes: &dyn FileHashLoader,
        output_key: RuleKey,
        universe: &BTreeSet<PathBuf>,
        used_inputs: &BTreeSet<PathBuf>,
    ) -> io::Result<()> {
        let mut input_index: HashMap<String, u32> = HashMap::new();
        for (index, input) in self.inputs.iter().enumerate() {
            let _ = input_index.insert(input.clone(), table_index(index)?);
        }
        let mut hash_index: HashMap<(u32, ContentHash), u32> = HashMap::new();
        for (index, pair) in self.hashes.iter().enumerate() {
            let _ = hash_index.insert(*pair, table_index(index)?);
        }

        let mut refs = Vec::new();
        for input in used_inputs.intersection(universe) {
            let hash = hashes.get(input)?;
            let name = path_key(input);
            let input_ref = match input_index.get(&name) {
                Some(index) => *index,
                None => {
                    let index = table_index(self.inputs.len())?;
                    self.inputs.push(name.clone());
                    let _ = input_index.insert(name, index);
                    index
                }
            };
            let hash_ref = match hash_index.get(&(input_ref, hash)) {
                Some(index) => *index,
                None => {
                    let index = table_index(self.hashes.len())?;
                    self.hashes.push((input_ref, hash));
                    let _ = hash_index.insert((input_ref, hash), index);
                    index
                }
            };
            refs.push(hash_ref);
        }

        self.entries.retain(|(key, _)| *key != output_key);
        self.entries.push((output_key, refs));
        Ok(())
    }

    /// Output key of the newest entry whose tracked inputs all match `current`.
    ///
    /// Inputs absent from `current` never match.
    #[must_use]
    pub fn lookup(&self, current: &BTreeMap<PathBuf, ContentHash>) -> Option<RuleKey> {
        self.entries.iter().rev().find_map(|(key, refs)| {
            let matches = refs.iter().all(|hash_ref| {
                let (input_ref, hash) = &self.hashes[*hash_ref as usize];
                let input = Path::new(&self.inputs[*input_ref as usize]);
                current.get(input) == Some(hash)
            });
            matches.then_some(*key)
        })
    }

    /// Every input path some entry tracks
    pub fn tracked_inputs(&self) -> impl Iterator<Item = &Path> {
        self.inputs.iter().map(Path::new)
    }

    /// Write header and body
    ///
    /// # Errors
    ///
    /// I/O and encoder errors
    pub fn serialize<W: Write>(&self, mut writer: W) -> Result<(), ManifestError> {
        let header = Header {
            version: MANIFEST_VERSION,
        };
        ciborium::into_writer(&header, &mut writer).map_err(|e| ManifestError::Encode(e.to_string()))?;
        ciborium::into_writer(self, &mut writer).map_err(|e| ManifestError::Encode(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    /// Read a manifest written by [`Manifest::serialize`]
    ///
    /// # Errors
    ///
    /// `ManifestError::Version` for other format versions, `Decode` for
    /// malformed or inconsistent content
    pub fn deserialize<R: Read>(mut reader: R) -> Result<Self, ManifestError> {
        let header: Header =
            ciborium::from_reader(&mut reader).map_err(|e| ManifestError::Decode(e.to_string()))?;
        if header.version != MANIFEST_VERSION {
            return Err(ManifestError::Version {
                found: header.version,
                expected: MANIFEST_VERSION,
            });
        }
        let manifest: Self = ciborium::from_reader(&mut reader).map_err(|e| ManifestError::Decode(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if let Some((input_ref, _)) = self.hashes.iter().find(|(i, _)| *i as usize >= self.inputs.len()) {
            return Err(ManifestError::Decode(format!("input index {input_ref} out of range")));
        }
        for (_, refs) in &self.entries {
            if let Some(hash_ref) = refs.iter().find(|h| **h as usize >= self.hashes.len()) {
                return Err(ManifestError::Decode(format!("hash index {hash_ref} out of range")));
            }
        }
        Ok(())
    }
}
