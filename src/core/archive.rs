//! Tar+gzip construction and extraction for payloads and outer archives.
//!
//! Everything here is blocking I/O over `Read`/`Write` streams; async
//! callers run it on the blocking pool.

use anyhow::{Context, Result, anyhow};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};
use tracing::{debug, warn};

use super::manifest::{BackupManifest, MANIFEST_ENTRY};
use crate::error::{BackupError, BackupResult};

/// Manifests are tiny; anything larger is not ours
const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

/// Walk `dir` and stream every file into a gzip-compressed tar.
///
/// Entry names are relative to `dir`; directories are implied by file paths.
pub fn build_tar_gz<W: Write>(dir: &Path, writer: W) -> Result<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(encoder);

    let files = collect_files(dir)?;
    for (absolute, relative) in &files {
        builder
            .append_path_with_name(absolute, relative)
            .with_context(|| format!("Failed to append {}", absolute.display()))?;
    }

    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    let writer = encoder.finish().context("Failed to finish compression")?;

    debug!("Archived {} files from {}", files.len(), dir.display());
    Ok(writer)
}

/// [`build_tar_gz`] into a file, returning its size
pub fn build_tar_gz_file(dir: &Path, dest: &Path) -> Result<u64> {
    let file = File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let writer = build_tar_gz(dir, BufWriter::new(file))?;
    finish_file(writer, dest)
}

/// Write the two-entry outer archive: the manifest, then the payload
pub fn build_outer_archive<W: Write>(
    manifest_json: &[u8],
    payload: &Path,
    entry_name: &str,
    writer: W,
) -> Result<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(encoder);

    let mut header = Header::new_gnu();
    header.set_path(MANIFEST_ENTRY)?;
    header.set_size(manifest_json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder
        .append(&header, manifest_json)
        .context("Failed to append manifest")?;

    let mut payload_file = File::open(payload)
        .with_context(|| format!("Failed to open payload {}", payload.display()))?;
    builder
        .append_file(entry_name, &mut payload_file)
        .context("Failed to append payload")?;

    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    encoder.finish().context("Failed to finish compression")
}

/// [`build_outer_archive`] into a file, returning its size
pub fn build_outer_archive_file(
    manifest_json: &[u8],
    payload: &Path,
    entry_name: &str,
    dest: &Path,
) -> Result<u64> {
    let file = File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let writer = build_outer_archive(manifest_json, payload, entry_name, BufWriter::new(file))?;
    finish_file(writer, dest)
}

/// Gunzip and unpack `reader` into `dest`, optionally keeping only entries
/// whose path starts with `prefix`. Returns the unpacked paths.
///
/// Entries that would escape `dest` are skipped.
pub fn extract<R: Read>(reader: R, dest: &Path, prefix: Option<&str>) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut extracted = Vec::new();

    for entry in archive.entries().context("Failed to read archive")? {
        let mut entry = entry.context("Failed to read archive entry")?;
        let path = entry.path().context("Invalid entry path")?.into_owned();

        if let Some(prefix) = prefix {
            if !path.to_string_lossy().starts_with(prefix) {
                continue;
            }
        }

        let unpacked = entry
            .unpack_in(dest)
            .with_context(|| format!("Failed to unpack {}", path.display()))?;

        if unpacked {
            extracted.push(dest.join(&path));
        } else {
            warn!("Skipped archive entry outside destination: {}", path.display());
        }
    }

    Ok(extracted)
}

/// [`extract`] from a file on disk
pub fn extract_file(archive: &Path, dest: &Path, prefix: Option<&str>) -> Result<Vec<PathBuf>> {
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    extract(BufReader::new(file), dest, prefix)
}

/// Read and validate only the manifest of an outer archive.
///
/// Traversal stops at `backup.json`, so the payload is never decompressed.
pub fn read_manifest(path: &Path) -> BackupResult<BackupManifest> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = archive
        .entries()
        .map_err(|e| BackupError::corrupt(format!("not a backup archive: {}", e)))?;

    for entry in entries {
        let entry = entry.map_err(|e| BackupError::corrupt(format!("unreadable archive: {}", e)))?;
        let is_manifest = entry
            .path()
            .map(|p| p.to_str() == Some(MANIFEST_ENTRY))
            .unwrap_or(false);

        if !is_manifest {
            continue;
        }

        if entry.size() > MAX_MANIFEST_SIZE {
            return Err(BackupError::corrupt(format!("{} is too large", MANIFEST_ENTRY)));
        }

        let mut bytes = Vec::new();
        entry
            .take(MAX_MANIFEST_SIZE)
            .read_to_end(&mut bytes)
            .map_err(|e| BackupError::corrupt(format!("unreadable {}: {}", MANIFEST_ENTRY, e)))?;

        return BackupManifest::from_json(&bytes);
    }

    Err(BackupError::corrupt(format!("archive has no {}", MANIFEST_ENTRY)))
}

/// Entry names of an archive, in order
#[cfg(test)]
pub(crate) fn entry_names(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        names.push(entry?.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

fn finish_file(writer: BufWriter<File>, dest: &Path) -> Result<u64> {
    let file = writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush {}: {}", dest.display(), e))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Regular files under `root` as (absolute, relative) pairs, sorted by path
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read directory {}", current.display()))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .context("Failed to calculate relative path")?
                    .to_path_buf();
                files.push((path, relative));
            } else {
                warn!("Skipping non-regular file: {}", path.display());
            }
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::Category;
    use crate::core::manifest::{BackupManifest, PAYLOAD_ENTRY, generate_slug};
    use tempfile::tempdir;

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join("report-templates/nested")).unwrap();
        std::fs::write(dir.join("users.json"), r#"[{"username":"alice"}]"#).unwrap();
        std::fs::write(dir.join("languages.json"), "[]").unwrap();
        std::fs::write(dir.join("report-templates/abc123.docx"), b"PK\x03\x04docx").unwrap();
        std::fs::write(dir.join("report-templates/nested/def456.xlsx"), b"xlsx").unwrap();
    }

    #[test]
    fn test_payload_round_trip_preserves_nested_tree() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        populate(&source);

        let payload = dir.path().join("data.tar.gz");
        build_tar_gz_file(&source, &payload).unwrap();

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let extracted = extract_file(&payload, &out, None).unwrap();

        assert_eq!(extracted.len(), 4);
        assert_eq!(
            std::fs::read(out.join("report-templates/nested/def456.xlsx")).unwrap(),
            b"xlsx"
        );
        assert_eq!(
            std::fs::read_to_string(out.join("users.json")).unwrap(),
            r#"[{"username":"alice"}]"#
        );
    }

    #[test]
    fn test_outer_archive_has_manifest_first() {
        let dir = tempdir().unwrap();
        let payload = dir.path().join("data.tar.gz");
        std::fs::write(&payload, b"payload bytes").unwrap();

        let manifest = BackupManifest::new("Nightly".into(), generate_slug(), false, vec![Category::Users]);
        let outer = dir.path().join("outer.tar");
        build_outer_archive_file(&manifest.to_json().unwrap(), &payload, PAYLOAD_ENTRY, &outer).unwrap();

        assert_eq!(entry_names(&outer).unwrap(), vec!["backup.json", "data.tar.gz"]);
        assert_eq!(read_manifest(&outer).unwrap(), manifest);
    }

    #[test]
    fn test_prefix_filter_extracts_only_payload() {
        let dir = tempdir().unwrap();
        let payload = dir.path().join("data.tar.gz");
        std::fs::write(&payload, b"payload bytes").unwrap();

        let manifest = BackupManifest::new("x".into(), generate_slug(), false, vec![]);
        let outer = dir.path().join("outer.tar");
        build_outer_archive_file(&manifest.to_json().unwrap(), &payload, PAYLOAD_ENTRY, &outer).unwrap();

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let extracted = extract_file(&outer, &out, Some("data.tar.gz")).unwrap();

        assert_eq!(extracted, vec![out.join("data.tar.gz")]);
        assert!(!out.join("backup.json").exists());
        assert_eq!(std::fs::read(out.join("data.tar.gz")).unwrap(), b"payload bytes");
    }

    #[test]
    fn test_read_manifest_rejects_garbage() {
        let dir = tempdir().unwrap();

        let garbage = dir.path().join("garbage.tar");
        std::fs::write(&garbage, b"definitely not gzip").unwrap();
        let err = read_manifest(&garbage).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Corrupt);

        // A valid tar.gz without backup.json
        let source = dir.path().join("source");
        populate(&source);
        let no_manifest = dir.path().join("no_manifest.tar");
        build_tar_gz_file(&source, &no_manifest).unwrap();
        let err = read_manifest(&no_manifest).unwrap_err();
        assert!(err.to_string().contains("no backup.json"), "{}", err);
    }
}
