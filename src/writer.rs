//! Artifact writing.
//!
//! Serializes a decoded mesh to OBJ and/or STL inside an [`ArtifactDir`].
//! Each file is written to a hidden temp file in the same directory, flushed,
//! fsynced and then renamed into place, so a path is only ever handed out for
//! a complete file. A temp file is removed on any failure.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::mesh::TriMesh;
use crate::{Error, Result};

/// Longest file stem derived from a prompt, in characters.
pub const MAX_STEM_CHARS: usize = 100;

/// Longest file stem in UTF-8 bytes. Leaves room for the extension under the
/// usual 255-byte file name limit.
pub const MAX_STEM_BYTES: usize = 240;

/// Supported exchange formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Obj,
    Stl,
}

impl Format {
    pub const ALL: [Format; 2] = [Format::Obj, Format::Stl];

    /// Parse from a file extension or name ("obj", ".STL").
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "obj" => Some(Self::Obj),
            "stl" => Some(Self::Stl),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Obj => "obj",
            Self::Stl => "stl",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// STL flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StlEncoding {
    #[default]
    Binary,
    Ascii,
}

/// A completely written artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub format: Format,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl Artifact {
    /// Read the file back, e.g. to offer it for download.
    pub fn read(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| Error::write(Some(self.format), &self.path, e))
    }
}

/// Where artifacts land.
#[derive(Debug)]
pub enum ArtifactDir {
    /// A fresh temporary directory, deleted with everything in it on drop.
    Scoped(TempDir),
    /// A caller-owned directory that outlives the request.
    Persistent(PathBuf),
}

impl ArtifactDir {
    pub fn scoped() -> Result<Self> {
        tempfile::Builder::new()
            .prefix("text3d-")
            .tempdir()
            .map(Self::Scoped)
            .map_err(|e| Error::write(None, std::env::temp_dir(), e))
    }

    /// Use `path`, creating it if missing.
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path).map_err(|e| Error::write(None, &path, e))?;
        Ok(Self::Persistent(path))
    }

    /// A new, uniquely named directory under `root` (`<unix-millis>-<random>`)
    /// that is kept after the request.
    pub fn spooled(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| Error::write(None, root, e))?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        tempfile::Builder::new()
            .prefix(&format!("{millis}-"))
            .tempdir_in(root)
            .map(|dir| Self::Persistent(dir.keep()))
            .map_err(|e| Error::write(None, root, e))
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Scoped(dir) => dir.path(),
            Self::Persistent(path) => path,
        }
    }

    pub fn is_scoped(&self) -> bool {
        matches!(self, Self::Scoped(_))
    }

    /// Stop managing the directory and return its path. A scoped directory
    /// is no longer deleted.
    pub fn keep(self) -> PathBuf {
        match self {
            Self::Scoped(dir) => dir.keep(),
            Self::Persistent(path) => path,
        }
    }
}

/// File stem for a prompt: spaces and path-hostile characters become `_`.
///
/// Capped at [`MAX_STEM_CHARS`] characters and [`MAX_STEM_BYTES`] bytes,
/// cut on a character boundary.
pub fn artifact_stem(prompt: &str) -> String {
    let mut stem = String::new();
    let sanitized = prompt.trim().chars().map(|c| match c {
        ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
        c if c.is_control() => '_',
        c => c,
    });
    for c in sanitized.take(MAX_STEM_CHARS) {
        if stem.len() + c.len_utf8() > MAX_STEM_BYTES {
            break;
        }
        stem.push(c);
    }

    if stem.chars().all(|c| c == '.') {
        "model".to_string()
    } else {
        stem
    }
}

/// Writes meshes to artifact files.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetWriter {
    pub stl_encoding: StlEncoding,
}

impl AssetWriter {
    pub fn new(stl_encoding: StlEncoding) -> Self {
        Self { stl_encoding }
    }

    /// Write `mesh` once per requested format as `<dir>/<stem>.<ext>`.
    ///
    /// Formats are written in request order, duplicates ignored. The first
    /// failure aborts the rest; files finished before it are left in place.
    pub fn write(
        &self,
        mesh: &TriMesh,
        formats: &[Format],
        dir: &ArtifactDir,
        stem: &str,
    ) -> Result<BTreeMap<Format, Artifact>> {
        let mut artifacts = BTreeMap::new();
        for &format in formats {
            if artifacts.contains_key(&format) {
                continue;
            }
            let artifact = self.write_one(mesh, format, dir.path(), stem)?;
            tracing::info!(
                format = %format,
                path = %artifact.path.display(),
                bytes = artifact.size_bytes,
                "artifact written"
            );
            artifacts.insert(format, artifact);
        }
        Ok(artifacts)
    }

    fn write_one(
        &self,
        mesh: &TriMesh,
        format: Format,
        dir: &Path,
        stem: &str,
    ) -> Result<Artifact> {
        let path = dir.join(format!("{stem}.{}", format.extension()));
        let fail = |e: std::io::Error| Error::write(Some(format), &path, e);

        let tmp = tempfile::Builder::new()
            .prefix(".text3d-")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(fail)?;

        let mut out = BufWriter::new(tmp);
        self.serialize(mesh, format, stem, &mut out).map_err(fail)?;
        let tmp = out.into_inner().map_err(|e| fail(e.into_error()))?;
        tmp.as_file().sync_all().map_err(fail)?;

        let file: File = tmp.persist(&path).map_err(|e| fail(e.error))?;
        let size_bytes = file.metadata().map_err(fail)?.len();

        Ok(Artifact {
            format,
            path,
            size_bytes,
        })
    }

    fn serialize<W: Write>(
        &self,
        mesh: &TriMesh,
        format: Format,
        stem: &str,
        out: W,
    ) -> std::io::Result<()> {
        match (format, self.stl_encoding) {
            (Format::Obj, _) => mesh.write_obj(out),
            (Format::Stl, StlEncoding::Binary) => mesh.write_stl(out),
            (Format::Stl, StlEncoding::Ascii) => mesh.write_stl_ascii(out, stem),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::tests::{parse_obj, tetrahedron};

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("obj"), Some(Format::Obj));
        assert_eq!(Format::parse(".STL"), Some(Format::Stl));
        assert_eq!(Format::parse("ply"), None);
        assert_eq!(Format::Stl.to_string(), "stl");
    }

    #[test]
    fn test_artifact_stem() {
        assert_eq!(artifact_stem("a small toy car"), "a_small_toy_car");
        assert_eq!(artifact_stem("  padded  "), "padded");
        assert_eq!(artifact_stem("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(artifact_stem("tab\there"), "tab_here");
        assert_eq!(artifact_stem(""), "model");
        assert_eq!(artifact_stem(".."), "model");
        assert_eq!(artifact_stem(&"x".repeat(500)).chars().count(), MAX_STEM_CHARS);
    }

    #[test]
    fn test_artifact_stem_respects_byte_limit() {
        // 3 bytes per char: 90 chars would be 270 bytes.
        let chairs = artifact_stem(&"椅".repeat(90));
        assert_eq!(chairs, "椅".repeat(80));
        assert_eq!(chairs.len(), MAX_STEM_BYTES);

        // 4-byte emoji never get split.
        let emoji = artifact_stem(&"🪑".repeat(100));
        assert_eq!(emoji.len(), 240);
        assert!(emoji.chars().all(|c| c == '🪑'));
    }

    #[test]
    fn test_long_multibyte_prompt_can_be_written() {
        let dir = ArtifactDir::scoped().unwrap();
        let stem = artifact_stem(&"椅".repeat(90));
        let artifacts = AssetWriter::default()
            .write(&tetrahedron(), &[Format::Obj, Format::Stl], &dir, &stem)
            .unwrap();
        assert_eq!(artifacts.len(), 2);
        assert!(artifacts.values().all(|a| a.path.exists()));
    }

    #[test]
    fn test_spooled_dirs_are_unique_and_kept() {
        let root = tempfile::tempdir().unwrap();
        let spool = root.path().join("spool");
        let first = ArtifactDir::spooled(&spool).unwrap();
        let second = ArtifactDir::spooled(&spool).unwrap();
        assert!(!first.is_scoped());
        assert_ne!(first.path(), second.path());
        assert!(first.path().starts_with(&spool));

        // Equal prompts in separate spool dirs keep separate files.
        let writer = AssetWriter::default();
        writer.write(&tetrahedron(), &[Format::Obj], &first, "same").unwrap();
        writer.write(&tetrahedron(), &[Format::Obj], &second, "same").unwrap();
        let (first, second) = (first.keep(), second.keep());
        assert!(first.join("same.obj").exists());
        assert!(second.join("same.obj").exists());
    }

    #[test]
    fn test_directory_failure_has_no_format() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("occupied");
        std::fs::write(&file, b"not a directory").unwrap();

        let err = ArtifactDir::persistent(file.join("out")).unwrap_err();
        match err {
            Error::Write { format, path, .. } => {
                assert_eq!(format, None);
                assert_eq!(path, file.join("out"));
            }
            other => panic!("expected write error, got {other}"),
        }
    }

    #[test]
    fn test_writes_both_formats_atomically() {
        let dir = ArtifactDir::scoped().unwrap();
        let mesh = tetrahedron();
        let artifacts = AssetWriter::default()
            .write(&mesh, &[Format::Obj, Format::Stl, Format::Obj], &dir, "tetra")
            .unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(file_names(dir.path()), vec!["tetra.obj", "tetra.stl"]);

        let obj = &artifacts[&Format::Obj];
        let text = String::from_utf8(obj.read().unwrap()).unwrap();
        assert_eq!(obj.size_bytes, text.len() as u64);
        let (vertices, faces) = parse_obj(&text);
        assert_eq!(vertices, 4);
        assert_eq!(faces.len(), 4);

        let stl = &artifacts[&Format::Stl];
        assert_eq!(stl.size_bytes, 84 + 50 * 4);
    }

    #[test]
    fn test_ascii_stl_uses_stem_as_solid_name() {
        let dir = ArtifactDir::scoped().unwrap();
        let artifacts = AssetWriter::new(StlEncoding::Ascii)
            .write(&tetrahedron(), &[Format::Stl], &dir, "tetra")
            .unwrap();
        let text = String::from_utf8(artifacts[&Format::Stl].read().unwrap()).unwrap();
        assert!(text.starts_with("solid tetra\n"));
    }

    #[test]
    fn test_scoped_dir_is_removed_on_drop() {
        let dir = ArtifactDir::scoped().unwrap();
        let path = dir.path().to_path_buf();
        AssetWriter::default()
            .write(&tetrahedron(), &[Format::Obj], &dir, "tetra")
            .unwrap();
        assert!(path.join("tetra.obj").exists());
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn test_keep_detaches_scoped_dir() {
        let dir = ArtifactDir::scoped().unwrap();
        let path = dir.keep();
        assert!(path.exists());
        std::fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn test_persistent_dir_survives() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("nested/out");
        let dir = ArtifactDir::persistent(&target).unwrap();
        assert!(!dir.is_scoped());
        AssetWriter::default()
            .write(&tetrahedron(), &[Format::Obj], &dir, "tetra")
            .unwrap();
        drop(dir);
        assert!(target.join("tetra.obj").exists());
    }

    #[test]
    fn test_missing_directory_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("gone");
        let dir = ArtifactDir::persistent(&target).unwrap();
        std::fs::remove_dir(&target).unwrap();

        let err = AssetWriter::default()
            .write(&tetrahedron(), &[Format::Obj, Format::Stl], &dir, "tetra")
            .unwrap_err();
        match &err {
            Error::Write { format, path, .. } => {
                assert_eq!(*format, Some(Format::Obj));
                assert_eq!(path, &target.join("tetra.obj"));
            }
            other => panic!("expected write error, got {other}"),
        }
        assert!(!target.exists());
    }

    #[test]
    fn test_failure_keeps_earlier_artifacts_and_cleans_partial() {
        let dir = ArtifactDir::scoped().unwrap();
        // A directory squatting on the STL name makes the final rename fail.
        std::fs::create_dir(dir.path().join("tetra.stl")).unwrap();

        let err = AssetWriter::default()
            .write(&tetrahedron(), &[Format::Obj, Format::Stl], &dir, "tetra")
            .unwrap_err();
        assert!(matches!(err, Error::Write { format: Some(Format::Stl), .. }), "{err}");

        // OBJ finished before the failure and stays; no temp file is left.
        assert_eq!(file_names(dir.path()), vec!["tetra.obj", "tetra.stl"]);
        assert!(dir.path().join("tetra.stl").is_dir());
        let text = std::fs::read_to_string(dir.path().join("tetra.obj")).unwrap();
        assert_eq!(parse_obj(&text).0, 4);
    }
}
