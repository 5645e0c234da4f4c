use super::error::io_error;
use super::SandboxError;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Directory names never copied into an environment.
pub const DENYLISTED_DIRS: [&str; 12] = [
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".cache",
    ".parcel-cache",
    ".next",
];

const DENYLISTED_SUFFIXES: [&str; 2] = [".pyc", ".pyo"];

pub fn is_denylisted(name: &str, is_dir: bool) -> bool {
    if is_dir {
        DENYLISTED_DIRS.contains(&name)
    } else {
        DENYLISTED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    }
}

/// Filtered copy of a project, removed from disk when dropped.
#[derive(Debug)]
pub struct StagedProject {
    dir: TempDir,
    files: Vec<String>,
    skipped: Vec<String>,
}

impl StagedProject {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Relative `/`-separated paths of every staged file, sorted.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }
}

pub fn stage_project(source: &Path, staging_root: &Path) -> Result<StagedProject, SandboxError> {
    let metadata = fs::metadata(source).map_err(|e| io_error(source, e))?;
    if !metadata.is_dir() {
        return Err(SandboxError::InvalidProject {
            path: source.display().to_string(),
            reason: "not a directory".to_string(),
        });
    }
    fs::create_dir_all(staging_root).map_err(|e| io_error(staging_root, e))?;
    let dir = tempfile::Builder::new()
        .prefix("stage-")
        .tempdir_in(staging_root)
        .map_err(|e| io_error(staging_root, e))?;

    let mut files = Vec::new();
    let mut skipped = Vec::new();
    copy_filtered(source, dir.path(), "", &mut files, &mut skipped)?;
    files.sort();
    skipped.sort();
    Ok(StagedProject {
        dir,
        files,
        skipped,
    })
}

fn copy_filtered(
    src: &Path,
    dst: &Path,
    prefix: &str,
    files: &mut Vec<String>,
    skipped: &mut Vec<String>,
) -> Result<(), SandboxError> {
    fs::create_dir_all(dst).map_err(|e| io_error(dst, e))?;
    for entry in fs::read_dir(src).map_err(|e| io_error(src, e))? {
        let entry = entry.map_err(|e| io_error(src, e))?;
        let src_path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        // symlinks are not followed; they could point outside the project
        let file_type = entry.file_type().map_err(|e| io_error(&src_path, e))?;
        if file_type.is_symlink() {
            skipped.push(relative);
            continue;
        }
        if is_denylisted(&name, file_type.is_dir()) {
            skipped.push(relative);
            continue;
        }
        let dst_path = dst.join(&name);
        if file_type.is_dir() {
            copy_filtered(&src_path, &dst_path, &relative, files, skipped)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| io_error(&src_path, e))?;
            files.push(relative);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denylist_matches_directories_and_bytecode() {
        assert!(is_denylisted("node_modules", true));
        assert!(is_denylisted("__pycache__", true));
        assert!(!is_denylisted("node_modules", false));
        assert!(is_denylisted("app.cpython-311.pyc", false));
        assert!(!is_denylisted("src", true));
    }

    #[test]
    fn staged_copy_is_removed_on_drop() {
        let project = tempfile::tempdir().expect("project");
        fs::write(project.path().join("index.js"), "console.log(1)").expect("write");
        let staging = tempfile::tempdir().expect("staging");
        let staged = stage_project(project.path(), staging.path()).expect("stage");
        let path = staged.path().to_path_buf();
        assert!(path.join("index.js").is_file());
        drop(staged);
        assert!(!path.exists());
    }
}
