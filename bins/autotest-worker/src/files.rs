//! Materialise a job's files into a workspace.
//!
//! Two sources: the submission archive downloaded from the front end, and the
//! assignment's test files kept in a local directory (`_files` in settings).

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use autotest_common::types::Credentials;
use nix::unistd::{chown, Gid};
use reqwest::header::AUTHORIZATION;
use std::fs;
use std::io::{self, Cursor};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

/// Mode of everything extracted from the submission archive.
pub const SUBMISSION_MODE: u32 = 0o770;
/// Modes of copied assignment directories and files.
pub const SCRIPT_DIR_MODE: u32 = 0o1770;
pub const SCRIPT_FILE_MODE: u32 = 0o750;

/// Something a zip archive can be fetched from.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch(&self, url: &str, credentials: Option<&Credentials>) -> Result<Vec<u8>>;
}

pub struct HttpArchiveSource {
    client: reqwest::Client,
}

impl HttpArchiveSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ArchiveSource for HttpArchiveSource {
    async fn fetch(&self, url: &str, credentials: Option<&Credentials>) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        if let Some(credentials) = credentials {
            request = request.header(AUTHORIZATION, credentials.header_value());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to download {}", url))?
            .error_for_status()
            .with_context(|| format!("Download of {} was rejected", url))?;
        let bytes = response.bytes().await?;
        debug!(url = %url, size = bytes.len(), "Archive downloaded");
        Ok(bytes.to_vec())
    }
}

/// An entry written into the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialised {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Extract a zip archive under `dest`, keeping relative paths.
///
/// Entries whose names would escape `dest` (absolute paths, `..`) reject the
/// whole archive.
pub fn extract_archive(bytes: &[u8], dest: &Path) -> Result<Vec<Materialised>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("Submission is not a valid zip archive")?;
    let mut written = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            bail!("Unsafe path in archive: {}", entry.name());
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            written.push(Materialised { path: target, is_dir: true });
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            io::copy(&mut entry, &mut out)?;
            written.push(Materialised { path: target, is_dir: false });
        }
    }

    // Directories created implicitly for nested files are part of the tree too.
    let mut implicit = Vec::new();
    for item in &written {
        let mut parent = item.path.parent();
        while let Some(dir) = parent {
            if dir == dest || !dir.starts_with(dest) {
                break;
            }
            let known = written.iter().chain(implicit.iter()).any(|m: &Materialised| m.path == dir);
            if !known {
                implicit.push(Materialised { path: dir.to_path_buf(), is_dir: true });
            }
            parent = dir.parent();
        }
    }
    written.extend(implicit);
    Ok(written)
}

/// Recursively copy the contents of `src` into `dest`.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<Vec<Materialised>> {
    if !src.is_dir() {
        bail!("directory does not exist: {}", src.display());
    }
    let mut copied = Vec::new();
    copy_dir(src, dest, &mut copied)?;
    Ok(copied)
}

fn copy_dir(src: &Path, dest: &Path, copied: &mut Vec<Materialised>) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            copied.push(Materialised { path: target.clone(), is_dir: true });
            copy_dir(&entry.path(), &target, copied)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied.push(Materialised { path: target, is_dir: false });
        }
    }
    Ok(())
}

/// Set modes, and the group when given, on materialised entries.
pub fn apply_modes(entries: &[Materialised], dir_mode: u32, file_mode: u32, group: Option<Gid>) -> Result<()> {
    for entry in entries {
        let mode = if entry.is_dir { dir_mode } else { file_mode };
        fs::set_permissions(&entry.path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set mode on {}", entry.path.display()))?;
        if let Some(gid) = group {
            chown(&entry.path, None, Some(gid))
                .with_context(|| format!("Failed to set group on {}", entry.path.display()))?;
        }
    }
    Ok(())
}

/// Lay out a workspace: the submission first, then the assignment files on
/// top of it.
pub fn materialise(
    archive: &[u8],
    script_dir: Option<&Path>,
    workspace: &Path,
    group: Option<Gid>,
) -> Result<()> {
    let submission = extract_archive(archive, workspace)?;
    apply_modes(&submission, SUBMISSION_MODE, SUBMISSION_MODE, group)?;

    if let Some(script_dir) = script_dir {
        let scripts = copy_tree(script_dir, workspace)?;
        apply_modes(&scripts, SCRIPT_DIR_MODE, SCRIPT_FILE_MODE, group)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    pub(crate) fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn test_extract_keeps_relative_paths() {
        let dest = tempfile::tempdir().unwrap();
        let archive = zip_of(&[("submission.py", "print(1)"), ("pkg/util.py", "x = 1"), ("empty/", "")]);

        let written = extract_archive(&archive, dest.path()).unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("submission.py")).unwrap(), "print(1)");
        assert_eq!(fs::read_to_string(dest.path().join("pkg/util.py")).unwrap(), "x = 1");
        assert!(dest.path().join("empty").is_dir());
        assert!(written.iter().any(|m| m.is_dir && m.path == dest.path().join("pkg")));
    }

    #[test]
    fn test_extract_rejects_escaping_paths() {
        let dest = tempfile::tempdir().unwrap();
        let archive = zip_of(&[("../evil.sh", "rm -rf /")]);

        assert!(extract_archive(&archive, dest.path()).is_err());
        assert!(!dest.path().parent().unwrap().join("evil.sh").exists());
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let dest = tempfile::tempdir().unwrap();
        assert!(extract_archive(b"definitely not a zip", dest.path()).is_err());
    }

    #[test]
    fn test_materialise_sets_modes() {
        let workspace = tempfile::tempdir().unwrap();
        let scripts = tempfile::tempdir().unwrap();
        fs::create_dir(scripts.path().join("tests")).unwrap();
        fs::write(scripts.path().join("tests/test_a.py"), "def test(): pass").unwrap();
        let archive = zip_of(&[("sub/answer.py", "x = 1")]);

        materialise(&archive, Some(scripts.path()), workspace.path(), None).unwrap();

        assert_eq!(mode_of(&workspace.path().join("sub")), SUBMISSION_MODE);
        assert_eq!(mode_of(&workspace.path().join("sub/answer.py")), SUBMISSION_MODE);
        assert_eq!(mode_of(&workspace.path().join("tests")), SCRIPT_DIR_MODE);
        assert_eq!(mode_of(&workspace.path().join("tests/test_a.py")), SCRIPT_FILE_MODE);
    }

    #[test]
    fn test_copy_tree_requires_source() {
        let dest = tempfile::tempdir().unwrap();
        assert!(copy_tree(Path::new("/nonexistent/files"), dest.path()).is_err());
    }
}
