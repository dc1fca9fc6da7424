//! # Prepare Module
//!
//! Turns the target given on the command line into an executable with debug information.
//!
//! Go and C sources are compiled without optimizations and with frame pointers into a
//! temporary file, which is removed again when the [`PreparedTarget`] is dropped. Anything
//! else has to be an executable already.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::errors::{DebuggerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Go,
    C,
}

impl SourceKind {
    /// Decides by the file extension, `None` for anything that is no known source file
    #[must_use]
    pub fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "go" => Some(Self::Go),
            "c" => Some(Self::C),
            _ => None,
        }
    }

    fn toolchain(self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::C => "cc",
        }
    }

    fn arguments(self, source: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = match self {
            Self::Go => vec!["build".into(), "-gcflags".into(), "all=-N -l".into()],
            Self::C => vec![
                "-g".into(),
                "-O0".into(),
                "-fno-omit-frame-pointer".into(),
                "-fno-asynchronous-unwind-tables".into(),
                "-no-pie".into(),
            ],
        };
        args.push("-o".into());
        args.push(output.into());
        args.push(source.into());
        args
    }
}

/// An executable ready to be debugged
#[derive(Debug)]
pub struct PreparedTarget {
    path: PathBuf,
    /// Built by us, removed on drop unless kept
    built: bool,
    keep: bool,
}

impl PreparedTarget {
    /// Builds `target` if it is a source file, otherwise checks that it is a file
    ///
    /// # Errors
    ///
    /// Fails if the target does not exist or is no file, if the toolchain can not be found or
    /// if the build fails.
    pub fn prepare(target: impl AsRef<Path>, keep: bool) -> Result<Self> {
        let target = target.as_ref();
        if !target.exists() {
            return Err(DebuggerError::ExecutableDoesNotExist(
                target.to_string_lossy().to_string(),
            ));
        }
        if !target.is_file() {
            return Err(DebuggerError::ExecutableIsNotAFile(
                target.to_string_lossy().to_string(),
            ));
        }

        match SourceKind::of(target) {
            Some(kind) => {
                let output = build_path(target);
                build(kind, target, &output)?;
                Ok(Self {
                    path: output,
                    built: true,
                    keep,
                })
            }
            None => Ok(Self {
                path: target.to_owned(),
                built: false,
                keep,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PreparedTarget {
    fn drop(&mut self) {
        if !self.built {
            return;
        }
        if self.keep {
            info!("keeping the built executable {}", self.path.display());
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("could not remove {}: {e}", self.path.display());
        }
    }
}

fn build_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map_or_else(|| "target".into(), |s| s.to_string_lossy());
    std::env::temp_dir().join(format!("tdb-{stem}-{}", std::process::id()))
}

fn build(kind: SourceKind, source: &Path, output: &Path) -> Result<()> {
    let toolchain = which::which(kind.toolchain()).map_err(|e| {
        DebuggerError::Build(format!("{} is not installed: {e}", kind.toolchain()))
    })?;
    let args = kind.arguments(source, output);
    debug!("building with {} {args:?}", toolchain.display());

    let out = Command::new(&toolchain).args(&args).output()?;
    if !out.status.success() {
        return Err(DebuggerError::Build(format!(
            "{} failed with {}: {}",
            kind.toolchain(),
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    info!("built {} into {}", source.display(), output.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_source_kind() {
        assert_eq!(SourceKind::of(Path::new("main.go")), Some(SourceKind::Go));
        assert_eq!(SourceKind::of(Path::new("/a/b/x.c")), Some(SourceKind::C));
        assert_eq!(SourceKind::of(Path::new("/bin/true")), None);
        assert_eq!(SourceKind::of(Path::new("x.cpp")), None);
    }

    #[test]
    fn test_build_arguments() {
        let args = SourceKind::Go.arguments(Path::new("main.go"), Path::new("/tmp/out"));
        assert_eq!(
            args,
            vec!["build", "-gcflags", "all=-N -l", "-o", "/tmp/out", "main.go"]
        );
        let args = SourceKind::C.arguments(Path::new("x.c"), Path::new("/tmp/out"));
        assert!(args.contains(&OsString::from("-fno-asynchronous-unwind-tables")));
        assert_eq!(args.last(), Some(&OsString::from("x.c")));
    }

    #[test]
    fn test_ready_executable_is_kept() {
        let exe = std::env::current_exe().unwrap();
        let prepared = PreparedTarget::prepare(&exe, false).unwrap();
        assert_eq!(prepared.path(), exe);
        drop(prepared);
        assert!(exe.exists());
    }

    #[test]
    fn test_rejects_missing_and_directories() {
        assert!(matches!(
            PreparedTarget::prepare("/does/not/exist.c", false),
            Err(DebuggerError::ExecutableDoesNotExist(_))
        ));
        assert!(matches!(
            PreparedTarget::prepare("/", false),
            Err(DebuggerError::ExecutableIsNotAFile(_))
        ));
    }
}
