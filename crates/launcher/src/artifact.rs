use std::path::{PathBuf, MAIN_SEPARATOR};

use crate::error::{LaunchError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    /// Separator used by `path`; the remote side only gets the file name.
    pub separator: char,
}

impl ResolvedArtifact {
    pub fn file_name(&self) -> String {
        let path = self.path.to_string_lossy();
        path.rsplit(self.separator).next().unwrap_or_default().to_string()
    }
}

/// Maps a logical helper name to a local file.
pub trait ArtifactResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<ResolvedArtifact>;
}

/// Looks in explicit directories, then next to the running executable,
/// then along `$PATH`.
#[derive(Clone, Debug, Default)]
pub struct SearchPathResolver {
    dirs: Vec<PathBuf>,
    skip_env: bool,
}

impl SearchPathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.dirs.extend(dirs);
        self
    }

    /// Only search the explicit directories.
    pub fn explicit_only(mut self) -> Self {
        self.skip_env = true;
        self
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut dirs = self.dirs.clone();
        if self.skip_env {
            return dirs;
        }
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(PathBuf::from))
        {
            dirs.push(dir);
        }
        if let Some(paths) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&paths));
        }
        dirs
    }
}

impl ArtifactResolver for SearchPathResolver {
    fn resolve(&self, name: &str) -> Result<ResolvedArtifact> {
        let candidates = self.candidates();
        candidates
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
            .map(|path| ResolvedArtifact {
                path,
                separator: MAIN_SEPARATOR,
            })
            .ok_or_else(|| LaunchError::ArtifactNotFound {
                name: name.to_string(),
                searched: candidates.len(),
            })
    }
}
