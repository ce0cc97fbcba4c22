use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::decode;
use crate::errors::{Result, SandboxError};

/// How symlinks met below the base directory are treated during resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymlinkPolicy {
    /// Follow links; the link target must still lie inside the base.
    #[default]
    Follow,
    /// Any symlink component is rejected.
    NoFollow,
}

impl FromStr for SymlinkPolicy {
    type Err = SandboxError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "follow" => Ok(SymlinkPolicy::Follow),
            "nofollow" | "no-follow" | "no_follow" => Ok(SymlinkPolicy::NoFollow),
            other => Err(SandboxError::InvalidConfig(format!(
                "unknown symlink policy '{other}'"
            ))),
        }
    }
}

pub fn ensure_absolute_base(base_dir: &Path) -> Result<PathBuf> {
    if base_dir.is_relative() {
        return Err(SandboxError::InvalidConfig(
            "sandbox base directory must be absolute".to_string(),
        ));
    }
    Ok(base_dir.to_path_buf())
}

/// A canonical absolute path strictly below the resolver's base directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    path: PathBuf,
    relative: PathBuf,
}

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The segments below the base directory.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Maps untrusted names onto canonical paths inside one base directory.
///
/// Stages run in a fixed order and each one only narrows what the next sees:
/// percent-decode once, NUL and double-encoding checks, empty and absolute
/// checks, lexical `..` folding against the base, filesystem
/// canonicalization, and finally a segment-aligned containment check.
#[derive(Clone, Debug)]
pub struct PathResolver {
    base: PathBuf,
    symlinks: SymlinkPolicy,
}

impl PathResolver {
    /// The base must already exist; it is canonicalized here.
    pub fn new(base_dir: impl AsRef<Path>, symlinks: SymlinkPolicy) -> Result<Self> {
        let base = ensure_absolute_base(base_dir.as_ref())?;
        let base = fs::canonicalize(base)?;
        if base.parent().is_none() {
            return Err(SandboxError::InvalidConfig(
                "sandbox base directory must not be a filesystem root".to_string(),
            ));
        }
        if !base.is_dir() {
            return Err(SandboxError::InvalidConfig(
                "sandbox base directory is not a directory".to_string(),
            ));
        }
        Ok(Self { base, symlinks })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn symlinks(&self) -> SymlinkPolicy {
        self.symlinks
    }

    pub fn resolve(&self, raw: &str) -> Result<ResolvedPath> {
        if decode::carries_nul(raw) {
            return Err(SandboxError::InvalidInput("null byte not allowed"));
        }
        let decoded = decode::decode_once(raw);
        if decode::hides_encoded_traversal(&decoded) {
            return Err(SandboxError::DoubleEncoding);
        }
        if decoded.trim().is_empty() {
            return Err(SandboxError::InvalidInput("name must not be empty"));
        }
        if is_absolute_like(&decoded) {
            return Err(SandboxError::InvalidInput("absolute paths not allowed"));
        }

        let segments = normalize(&self.base, &decoded)?;
        let path = self.canonicalize(&segments)?;
        if !is_strictly_within(&self.base, &path) {
            return Err(SandboxError::Traversal);
        }
        let relative = path
            .strip_prefix(&self.base)
            .map_err(|_| SandboxError::Traversal)?
            .to_path_buf();
        Ok(ResolvedPath { path, relative })
    }

    // Walks from the base one segment at a time. The deepest existing prefix
    // is canonicalized; whatever does not exist yet is appended verbatim.
    fn canonicalize(&self, segments: &[&OsStr]) -> Result<PathBuf> {
        let mut current = self.base.clone();
        let mut rest = segments.iter();
        while let Some(segment) = rest.next() {
            let next = current.join(segment);
            let metadata = match fs::symlink_metadata(&next) {
                Ok(metadata) => metadata,
                Err(err) if is_missing(&err) => {
                    current = next;
                    current.extend(rest);
                    return Ok(current);
                }
                Err(err) => return Err(err.into()),
            };

            let is_dir = if metadata.file_type().is_symlink() {
                if self.symlinks == SymlinkPolicy::NoFollow {
                    return Err(SandboxError::Traversal);
                }
                current = match fs::canonicalize(&next) {
                    Ok(target) => target,
                    // dangling link: its target cannot be proven to stay inside
                    Err(err) if is_missing(&err) => return Err(SandboxError::Traversal),
                    Err(err) => return Err(err.into()),
                };
                if !current.starts_with(&self.base) {
                    return Err(SandboxError::Traversal);
                }
                current.is_dir()
            } else {
                current = next;
                metadata.is_dir()
            };

            if !is_dir {
                current.extend(rest);
                return Ok(current);
            }
        }
        Ok(current)
    }
}

/// Resolves `raw` against `base_dir`, following symlinks that stay inside it.
pub fn resolve(base_dir: &Path, raw: &str) -> Result<ResolvedPath> {
    PathResolver::new(base_dir, SymlinkPolicy::Follow)?.resolve(raw)
}

fn is_absolute_like(name: &str) -> bool {
    let bytes = name.as_bytes();
    let drive_letter = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    name.starts_with(['/', '\\']) || drive_letter || Path::new(name).is_absolute()
}

// Folds `name` onto the base's own segments the way a lexical join would,
// so `../files/x` under `/srv/files` comes back in as `x`. Returns the
// segments below the base. Both separators count on every platform.
fn normalize<'a>(base: &'a Path, name: &'a str) -> Result<Vec<&'a OsStr>> {
    let anchor: Vec<&OsStr> = base
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment),
            _ => None,
        })
        .collect();
    let mut joined = anchor.clone();
    for segment in name.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                joined.pop();
            }
            other => joined.push(OsStr::new(other)),
        }
    }
    // also rejects a name that folds back onto the base itself
    if joined.len() <= anchor.len() || joined[..anchor.len()] != anchor[..] {
        return Err(SandboxError::Traversal);
    }
    Ok(joined.split_off(anchor.len()))
}

fn is_strictly_within(base: &Path, candidate: &Path) -> bool {
    let mut candidate = candidate.components();
    base.components()
        .all(|segment| candidate.next() == Some(segment))
        && candidate.next().is_some()
}

fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver() -> (TempDir, PathResolver) {
        let temp = TempDir::new().unwrap();
        let resolver = PathResolver::new(temp.path(), SymlinkPolicy::Follow).unwrap();
        (temp, resolver)
    }

    fn kind(resolver: &PathResolver, raw: &str) -> crate::errors::RejectionKind {
        resolver.resolve(raw).unwrap_err().kind()
    }

    #[test]
    fn plain_names_land_under_the_base() {
        let (_temp, resolver) = resolver();
        let resolved = resolver.resolve("hello.txt").unwrap();
        assert_eq!(resolved.as_path(), resolver.base().join("hello.txt"));
        assert_eq!(resolved.relative(), Path::new("hello.txt"));
    }

    #[test]
    fn inner_parent_segments_fold_lexically() {
        let (_temp, resolver) = resolver();
        let resolved = resolver.resolve("notes/./drafts/../readme.md").unwrap();
        assert_eq!(resolved.relative(), Path::new("notes/readme.md"));
    }

    #[test]
    fn escaping_parent_segments_are_traversal() {
        use crate::errors::RejectionKind::Traversal;
        let (_temp, resolver) = resolver();
        assert_eq!(kind(&resolver, "../../etc/passwd"), Traversal);
        assert_eq!(kind(&resolver, "notes/../../../../etc/passwd"), Traversal);
        assert_eq!(kind(&resolver, "notes%2f..%2f..%2fsecret"), Traversal);
        assert_eq!(kind(&resolver, "..\\..\\windows\\win.ini"), Traversal);
    }

    #[test]
    fn excursion_above_the_base_that_comes_back_is_allowed() {
        let (_temp, resolver) = resolver();
        let name = resolver.base().file_name().unwrap().to_str().unwrap().to_string();

        let resolved = resolver.resolve(&format!("../{name}/hello.txt")).unwrap();
        assert_eq!(resolved.as_path(), resolver.base().join("hello.txt"));

        let err = resolver.resolve(&format!("../{name}-evil/hello.txt")).unwrap_err();
        assert_eq!(err.kind(), crate::errors::RejectionKind::Traversal);
        let err = resolver.resolve(&format!("../{name}")).unwrap_err();
        assert_eq!(err.kind(), crate::errors::RejectionKind::Traversal);
    }

    #[test]
    fn the_base_itself_is_not_a_valid_target() {
        use crate::errors::RejectionKind::Traversal;
        let (_temp, resolver) = resolver();
        assert_eq!(kind(&resolver, "."), Traversal);
        assert_eq!(kind(&resolver, "notes/.."), Traversal);
    }

    #[test]
    fn invalid_inputs_are_rejected_before_path_logic() {
        use crate::errors::RejectionKind::InvalidInput;
        let (_temp, resolver) = resolver();
        assert_eq!(kind(&resolver, ""), InvalidInput);
        assert_eq!(kind(&resolver, "   \t"), InvalidInput);
        assert_eq!(kind(&resolver, "file\0.txt"), InvalidInput);
        assert_eq!(kind(&resolver, "file%00.txt"), InvalidInput);
        assert_eq!(kind(&resolver, "a%00%80"), InvalidInput);
        assert_eq!(kind(&resolver, "a%00%zz"), InvalidInput);
        assert_eq!(kind(&resolver, "/etc/passwd"), InvalidInput);
        assert_eq!(kind(&resolver, "%2fetc%2fpasswd"), InvalidInput);
        assert_eq!(kind(&resolver, "C:\\x"), InvalidInput);
        assert_eq!(kind(&resolver, "\\\\server\\share"), InvalidInput);
    }

    #[test]
    fn double_encoding_is_rejected() {
        use crate::errors::RejectionKind::DoubleEncoding;
        let (_temp, resolver) = resolver();
        assert_eq!(kind(&resolver, "%252e%252e%252fsecret"), DoubleEncoding);
        assert_eq!(kind(&resolver, "notes%252f..%252fsecret"), DoubleEncoding);
        assert_eq!(kind(&resolver, "%25252e%25252e"), DoubleEncoding);
    }

    #[test]
    fn malformed_encoding_uses_the_raw_name() {
        let (_temp, resolver) = resolver();
        let resolved = resolver.resolve("100%.txt").unwrap();
        assert_eq!(resolved.relative(), Path::new("100%.txt"));
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_inside() {
        let base = Path::new("/srv/base");
        assert!(is_strictly_within(base, Path::new("/srv/base/a")));
        assert!(!is_strictly_within(base, Path::new("/srv/base-evil/a")));
        assert!(!is_strictly_within(base, Path::new("/srv/base")));
        assert!(!is_strictly_within(base, Path::new("/srv")));
    }

    #[test]
    fn missing_tail_is_appended_to_the_existing_prefix() {
        let (_temp, resolver) = resolver();
        fs::create_dir(resolver.base().join("notes")).unwrap();
        let resolved = resolver.resolve("notes/new/file.txt").unwrap();
        assert_eq!(
            resolved.as_path(),
            resolver.base().join("notes").join("new").join("file.txt")
        );
    }

    #[test]
    fn relative_base_is_rejected() {
        let err = PathResolver::new("relative/base", SymlinkPolicy::Follow).unwrap_err();
        assert_eq!(err.kind(), crate::errors::RejectionKind::InvalidConfig);
    }

    #[test]
    fn symlink_policy_parses() {
        assert_eq!("follow".parse::<SymlinkPolicy>().unwrap(), SymlinkPolicy::Follow);
        assert_eq!("NoFollow".parse::<SymlinkPolicy>().unwrap(), SymlinkPolicy::NoFollow);
        assert!("sometimes".parse::<SymlinkPolicy>().is_err());
    }

    #[cfg(unix)]
    mod symlinks {
        use super::*;
        use std::os::unix::fs::symlink;

        #[test]
        fn link_escaping_the_base_is_traversal() {
            let outside = TempDir::new().unwrap();
            let (_temp, resolver) = resolver();
            symlink(outside.path(), resolver.base().join("escape")).unwrap();
            let err = resolver.resolve("escape/secret.txt").unwrap_err();
            assert_eq!(err.kind(), crate::errors::RejectionKind::Traversal);
        }

        #[test]
        fn link_inside_the_base_is_followed() {
            let (_temp, resolver) = resolver();
            fs::create_dir(resolver.base().join("real")).unwrap();
            symlink(resolver.base().join("real"), resolver.base().join("alias")).unwrap();
            let resolved = resolver.resolve("alias/file.txt").unwrap();
            assert_eq!(resolved.as_path(), resolver.base().join("real").join("file.txt"));
        }

        #[test]
        fn dangling_link_is_traversal() {
            let (_temp, resolver) = resolver();
            symlink("/nonexistent/target", resolver.base().join("dangling")).unwrap();
            let err = resolver.resolve("dangling").unwrap_err();
            assert_eq!(err.kind(), crate::errors::RejectionKind::Traversal);
        }

        #[test]
        fn no_follow_rejects_any_link() {
            let temp = TempDir::new().unwrap();
            let resolver = PathResolver::new(temp.path(), SymlinkPolicy::NoFollow).unwrap();
            fs::create_dir(resolver.base().join("real")).unwrap();
            symlink(resolver.base().join("real"), resolver.base().join("alias")).unwrap();
            let err = resolver.resolve("alias/file.txt").unwrap_err();
            assert_eq!(err.kind(), crate::errors::RejectionKind::Traversal);
            assert!(resolver.resolve("real/file.txt").is_ok());
        }
    }
}
