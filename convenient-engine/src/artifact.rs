//! Packing rule outputs into cache artifacts and overlaying them back
//!
//! An artifact is a zstd-compressed tar archive whose entries are paths
//! relative to the project root.

use crate::rules::BuildRule;
use crate::target::BuildPaths;
use convenient_cache::{ArtifactCache, FetchResult, RuleKey};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const ZSTD_LEVEL: i32 = 3;

/// Pack `outputs` (relative to `project_root`) into `dest`
///
/// # Errors
///
/// If an output is missing or unreadable
pub fn pack_outputs(project_root: &Path, outputs: &[PathBuf], dest: &Path) -> io::Result<()> {
    let file = BufWriter::new(File::create(dest)?);
    let encoder = zstd::stream::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for output in outputs {
        let absolute = project_root.join(output);
        if !absolute.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("output {} was not produced", output.display()),
            ));
        }
        for entry in WalkDir::new(&absolute).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry.path().strip_prefix(project_root).map_err(io::Error::other)?;
            if entry.file_type().is_dir() {
                builder.append_dir(relative, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), relative)?;
            }
        }
    }

    let encoder = builder.into_inner()?;
    let mut file = encoder.finish()?;
    io::Write::flush(&mut file)?;
    Ok(())
}

/// Extract the artifact at `src` on top of `project_root`
///
/// Returns the number of entries written. Entries escaping the root are
/// skipped.
///
/// # Errors
///
/// If the archive is corrupt or a file cannot be written
pub fn unpack_artifact(src: &Path, project_root: &Path) -> io::Result<usize> {
    let decoder = zstd::stream::Decoder::new(BufReader::new(File::open(src)?))?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);

    let mut unpacked = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.unpack_in(project_root)? {
            unpacked += 1;
        } else {
            warn!("Skipping artifact entry outside the project: {}", entry.path()?.display());
        }
    }
    Ok(unpacked)
}

/// Remove a rule's previous outputs before new ones are written
///
/// # Errors
///
/// I/O errors other than a missing output
pub fn remove_outputs(project_root: &Path, outputs: &[PathBuf]) -> io::Result<()> {
    for output in outputs {
        let path = project_root.join(output);
        let removed = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        removed?;
    }
    Ok(())
}

/// Fetches artifacts into a rule's scratch directory and overlays them on the project
#[derive(Debug, Clone, Copy)]
pub struct ArtifactFetcher<'a> {
    paths: &'a BuildPaths,
}

impl<'a> ArtifactFetcher<'a> {
    /// Fetcher writing below `paths`
    #[must_use]
    pub fn new(paths: &'a BuildPaths) -> Self {
        Self { paths }
    }

    /// Fetch `key` and, on a hit, replace the rule's outputs with the artifact's.
    ///
    /// Download and unpack failures are reported as [`FetchResult::Error`].
    pub fn fetch_and_overlay(&self, cache: &dyn ArtifactCache, key: &RuleKey, rule: &dyn BuildRule) -> FetchResult {
        let scratch = self.paths.scratch_dir(rule.target());
        if let Err(e) = fs::create_dir_all(&scratch) {
            return FetchResult::error(e);
        }
        let download = match tempfile::Builder::new().prefix("artifact.").tempfile_in(&scratch) {
            Ok(file) => file.into_temp_path(),
            Err(e) => return FetchResult::error(e),
        };

        let result = cache.fetch(key, &download);
        if !result.is_success() {
            debug!("{}: cache {} on {}", rule.target(), result.label(), key);
            return result;
        }

        let root = self.paths.project_root();
        let overlaid =
            remove_outputs(root, rule.outputs()).and_then(|()| unpack_artifact(&download, root));
        match overlaid {
            Ok(entries) => {
                debug!("{}: unpacked {} entries from {}", rule.target(), entries, key);
                result
            }
            Err(e) => {
                warn!("{}: failed to unpack artifact {}: {}", rule.target(), key, e);
                FetchResult::error(format!("unpacking artifact {key}: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pack_then_overlay_restores_files_and_dirs() {
        let project = TempDir::new().unwrap();
        let root = project.path();
        fs::create_dir_all(root.join("out/gen/nested")).unwrap();
        fs::write(root.join("out/single.txt"), "single").unwrap();
        fs::write(root.join("out/gen/a.txt"), "a").unwrap();
        fs::write(root.join("out/gen/nested/b.txt"), "b").unwrap();

        let artifact = root.join("artifact.tar.zst");
        let outputs = vec![PathBuf::from("out/single.txt"), PathBuf::from("out/gen")];
        pack_outputs(root, &outputs, &artifact).unwrap();

        remove_outputs(root, &outputs).unwrap();
        assert!(!root.join("out/gen").exists());

        let other = TempDir::new().unwrap();
        assert!(unpack_artifact(&artifact, other.path()).unwrap() >= 3);
        unpack_artifact(&artifact, root).unwrap();
        assert_eq!(fs::read_to_string(root.join("out/single.txt")).unwrap(), "single");
        assert_eq!(fs::read_to_string(root.join("out/gen/nested/b.txt")).unwrap(), "b");
        assert_eq!(fs::read_to_string(other.path().join("out/gen/a.txt")).unwrap(), "a");
    }

    #[test]
    fn test_missing_output_fails_packing() {
        let project = TempDir::new().unwrap();
        let err = pack_outputs(
            project.path(),
            &[PathBuf::from("never-built")],
            &project.path().join("a.tar.zst"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_corrupt_artifact_is_an_error() {
        let project = TempDir::new().unwrap();
        let artifact = project.path().join("bad.tar.zst");
        fs::write(&artifact, b"definitely not zstd").unwrap();
        assert!(unpack_artifact(&artifact, project.path()).is_err());
    }
}
