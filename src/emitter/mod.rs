//! Project emitter.
//!
//! A pure I/O façade: materializes a backend's [`ProjectFiles`] under the
//! output directory (create directories, write generated files, copy assets,
//! mark scripts executable). All collections are ordered, so emitting twice
//! with identical inputs produces byte-identical trees.
use std::{error::Error, fmt::Display, fs, io, path::Path};

use log::info;

use crate::backend::ProjectFiles;

#[derive(Debug)]
pub struct EmitError {
    pub message: String,
}

impl EmitError {
    fn wrap(context: &str, path: &Path, error: io::Error) -> Self {
        Self {
            message: format!("{context} \"{}\": {error}", path.display()),
        }
    }
}

impl Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for EmitError {}

/// Write a generated project to `output_dir`, copying assets from
/// `asset_dir`.
pub fn emit_project(
    files: &ProjectFiles,
    output_dir: &Path,
    asset_dir: &Path,
) -> Result<(), EmitError> {
    fs::create_dir_all(output_dir)
        .map_err(|error| EmitError::wrap("failed to create directory", output_dir, error))?;

    for dir in files.dirs() {
        let path = output_dir.join(dir);
        fs::create_dir_all(&path)
            .map_err(|error| EmitError::wrap("failed to create directory", &path, error))?;
    }

    for (rel, content) in files.files() {
        let path = output_dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| EmitError::wrap("failed to create directory", parent, error))?;
        }
        fs::write(&path, content)
            .map_err(|error| EmitError::wrap("failed to write", &path, error))?;
        info!("wrote {}", path.display());
    }

    for (rel, asset_rel) in files.copies() {
        let from = asset_dir.join(asset_rel);
        let to = output_dir.join(rel);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| EmitError::wrap("failed to create directory", parent, error))?;
        }
        fs::copy(&from, &to)
            .map_err(|error| EmitError::wrap("failed to copy", &from, error))?;
        info!("copied {} -> {}", from.display(), to.display());
    }

    for rel in files.executables() {
        let path = output_dir.join(rel);
        make_executable(&path)
            .map_err(|error| EmitError::wrap("failed to chmod", &path, error))?;
    }

    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("abl-emitter-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn sample_files() -> ProjectFiles {
        let mut files = ProjectFiles::default();
        files.write("main.c", "int main(void) { return 0; }\n".to_owned());
        files.write("build.sh", "#!/bin/sh\n".to_owned());
        files.make_executable("build.sh");
        files.create_dir("iterations");
        files.copy("c/libabl.h", "libabl.h");
        files
    }

    fn sample_asset_dir(name: &str) -> PathBuf {
        let dir = scratch_dir(&format!("{name}-assets"));
        fs::create_dir_all(dir.join("c")).unwrap();
        fs::write(dir.join("c/libabl.h"), "/* header */\n").unwrap();
        dir
    }

    #[test]
    fn test_emit_writes_everything() {
        let out = scratch_dir("writes");
        let assets = sample_asset_dir("writes");

        emit_project(&sample_files(), &out, &assets).expect("should emit");

        assert!(out.join("main.c").is_file());
        assert!(out.join("libabl.h").is_file());
        assert!(out.join("iterations").is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(out.join("build.sh")).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }

        let _ = fs::remove_dir_all(&out);
        let _ = fs::remove_dir_all(&assets);
    }

    #[test]
    fn test_emit_is_idempotent() {
        let out = scratch_dir("idempotent");
        let assets = sample_asset_dir("idempotent");
        let files = sample_files();

        emit_project(&files, &out, &assets).expect("should emit");
        let first = fs::read(out.join("main.c")).unwrap();
        emit_project(&files, &out, &assets).expect("should emit again");
        let second = fs::read(out.join("main.c")).unwrap();
        assert_eq!(first, second);

        let _ = fs::remove_dir_all(&out);
        let _ = fs::remove_dir_all(&assets);
    }

    #[test]
    fn test_missing_asset_is_an_error() {
        let out = scratch_dir("missing");
        let assets = scratch_dir("missing-assets");
        fs::create_dir_all(&assets).unwrap();

        let err = emit_project(&sample_files(), &out, &assets).unwrap_err();
        assert!(err.message.contains("failed to copy"));

        let _ = fs::remove_dir_all(&out);
        let _ = fs::remove_dir_all(&assets);
    }
}
