//! Filesystem-rooted include provider.

use std::borrow::Cow;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

use super::{IncludeProvider, ProviderKind};

/// Serves files below a root directory.
///
/// Logical names are `/`-separated paths relative to the root. Absolute names
/// and names that would leave the root are never served. Files are served as
/// raw bytes, whatever their encoding.
#[derive(Debug, Clone)]
pub struct FilesystemProvider {
    id: String,
    root: PathBuf,
    extensions: Option<Vec<String>>,
}

impl FilesystemProvider {
    /// Creates a provider rooted at `root`.
    ///
    /// The root is canonicalized when it exists so that the provider id is
    /// stable regardless of how the path was spelled.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Self {
            id: format!("fs:{}", root.display()),
            root,
            extensions: None,
        }
    }

    /// Only serve files with one of the given extensions (without the dot).
    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        let name = name.replace('\\', "/");
        let relative = Path::new(&name);
        if name.is_empty() || relative.is_absolute() || name.starts_with('/') {
            return None;
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        if let Some(allowed) = &self.extensions {
            let ext = relative.extension()?.to_str()?;
            if !allowed.iter().any(|a| a == ext) {
                return None;
            }
        }

        let path = self.root.join(relative);
        // Symlinks may still point outside the root.
        let canonical = fs::canonicalize(&path).ok()?;
        if !canonical.starts_with(&self.root) || !canonical.is_file() {
            return None;
        }
        Some(canonical)
    }
}

impl IncludeProvider for FilesystemProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Filesystem
    }

    fn try_resolve(&self, name: &str) -> io::Result<Option<Cow<'_, [u8]>>> {
        let Some(path) = self.locate(name) else {
            return Ok(None);
        };
        match fs::read(&path) {
            Ok(content) => Ok(Some(Cow::Owned(content))),
            // Removed between lookup and read.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read(provider: &FilesystemProvider, name: &str) -> Option<Vec<u8>> {
        provider.try_resolve(name).unwrap().map(Cow::into_owned)
    }

    fn provider_with(files: &[(&str, &str)]) -> (TempDir, FilesystemProvider) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let provider = FilesystemProvider::new(dir.path());
        (dir, provider)
    }

    #[test]
    fn test_resolves_nested_paths() {
        let (_dir, provider) = provider_with(&[("math/vec.cuh", "struct Vec {};")]);
        assert_eq!(
            read(&provider, "math/vec.cuh").as_deref(),
            Some(&b"struct Vec {};"[..])
        );
        assert_eq!(
            read(&provider, "./math/vec.cuh").as_deref(),
            Some(&b"struct Vec {};"[..])
        );
        assert_eq!(read(&provider, "math/missing.cuh"), None);
        assert_eq!(provider.kind(), ProviderKind::Filesystem);
        assert!(provider.id().starts_with("fs:"));
    }

    #[test]
    fn test_rejects_escaping_names() {
        let outer = TempDir::new().unwrap();
        fs::write(outer.path().join("secret.h"), "secret").unwrap();
        let inner = outer.path().join("inner");
        fs::create_dir_all(&inner).unwrap();
        let provider = FilesystemProvider::new(&inner);

        assert_eq!(read(&provider, "../secret.h"), None);
        let absolute = outer.path().join("secret.h");
        assert_eq!(read(&provider, absolute.to_str().unwrap()), None);
        assert_eq!(read(&provider, ""), None);
    }

    #[test]
    fn test_serves_non_utf8_bytes() {
        let dir = TempDir::new().unwrap();
        let content = b"// caf\xe9\n#define W 4\n";
        fs::write(dir.path().join("vec.cuh"), content).unwrap();
        let provider = FilesystemProvider::new(dir.path());
        assert_eq!(read(&provider, "vec.cuh").as_deref(), Some(&content[..]));
    }

    #[test]
    fn test_directories_are_not_files() {
        let (_dir, provider) = provider_with(&[("math/vec.cuh", "x")]);
        assert_eq!(read(&provider, "math"), None);
    }

    #[test]
    fn test_extension_filter() {
        let (dir, _) = provider_with(&[("a.cuh", "header"), ("notes.txt", "text")]);
        let provider = FilesystemProvider::new(dir.path()).with_extensions(["cuh", "h"]);
        assert_eq!(read(&provider, "a.cuh").as_deref(), Some(&b"header"[..]));
        assert_eq!(read(&provider, "notes.txt"), None);
    }
}
