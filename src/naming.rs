//! File name sanitization and collision resolution.
//!
//! Names are made web-safe (ASCII, `[A-Za-z0-9.\-_]`, at most 255 bytes) and then
//! resolved against the existing entries of the target folder by probing
//! `stem.ext`, `stem_1.ext`, `stem_2.ext`, ... until a free name is found.
//!
//! Resolution is best-effort: two concurrent callers can both observe the
//! same free name before either writes it.

use std::path::Path;

use thiserror::Error;

/// Maximum length of a stored file name, in bytes
pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Default number of counter suffixes probed before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10_000;

/// Errors produced while computing a file name
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NamingError {
    /// The desired name is empty after trimming
    #[error("File name cannot be empty")]
    EmptyName,

    /// Every candidate up to the probe limit is taken
    #[error("No free name for '{name}' after {attempts} attempts")]
    Exhausted { name: String, attempts: u32 },
}

/// Make `name` safe for storage.
///
/// Transliterates to ASCII, replaces anything outside `[A-Za-z0-9.\-_]` with `_`,
/// collapses runs of dots so no `..` segment survives, and truncates to
/// [`MAX_FILE_NAME_LENGTH`] bytes while keeping the extension.
/// A name made only of dots is rejected as empty.
pub fn sanitize_file_name(name: &str) -> Result<String, NamingError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(NamingError::EmptyName);
    }

    let ascii = deunicode::deunicode(trimmed);
    let mut sanitized = String::with_capacity(ascii.len());
    for c in ascii.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
            c
        } else {
            '_'
        };
        if c == '.' && sanitized.ends_with('.') {
            continue;
        }
        sanitized.push(c);
    }
    if sanitized == "." {
        return Err(NamingError::EmptyName);
    }

    if sanitized.len() > MAX_FILE_NAME_LENGTH {
        let (stem, extension) = split_name(&sanitized);
        sanitized = match extension {
            Some(ext) if ext.len() + 1 < MAX_FILE_NAME_LENGTH => {
                let keep = MAX_FILE_NAME_LENGTH - ext.len() - 1;
                let stem = stem[..keep.min(stem.len())].trim_end_matches('.');
                format!("{}.{}", stem, ext)
            }
            _ => sanitized[..MAX_FILE_NAME_LENGTH].to_string(),
        };
    }

    Ok(sanitized)
}

/// Split a file name into stem and extension.
///
/// A leading dot does not start an extension (`.env` has no extension).
pub fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
    }
}

/// Build `<stem>_<suffix>.<ext>` from an already-sanitized name.
pub fn with_suffix(name: &str, suffix: &str) -> String {
    match split_name(name) {
        (stem, Some(ext)) => format!("{}_{}.{}", stem, suffix, ext),
        (stem, None) => format!("{}_{}", stem, suffix),
    }
}

/// Resolves collision-free names within a folder.
#[derive(Debug, Clone, Copy)]
pub struct UniqueNameResolver {
    max_attempts: u32,
}

impl Default for UniqueNameResolver {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl UniqueNameResolver {
    /// Create a resolver that gives up after `max_attempts` counter suffixes
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Resolve `desired` using `is_taken` as the existence probe.
    pub fn resolve_with<F>(&self, desired: &str, is_taken: F) -> Result<String, NamingError>
    where
        F: Fn(&str) -> bool,
    {
        let sanitized = sanitize_file_name(desired)?;
        if !is_taken(&sanitized) {
            return Ok(sanitized);
        }

        let (stem, extension) = split_name(&sanitized);
        for counter in 1..=self.max_attempts {
            let candidate = match extension {
                Some(ext) => format!("{}_{}.{}", stem, counter, ext),
                None => format!("{}_{}", stem, counter),
            };
            if !is_taken(&candidate) {
                return Ok(candidate);
            }
        }

        Err(NamingError::Exhausted {
            name: sanitized,
            attempts: self.max_attempts,
        })
    }

    /// Resolve `desired` against the entries of a local directory.
    pub fn resolve(&self, folder: &Path, desired: &str) -> Result<String, NamingError> {
        self.resolve_with(desired, |candidate| {
            folder.join(candidate).symlink_metadata().is_ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_transliterates_and_replaces() {
        assert_eq!(sanitize_file_name("Café déjà vu.png").unwrap(), "Cafe_deja_vu.png");
        assert_eq!(sanitize_file_name("rapport (final)#2.pdf").unwrap(), "rapport__final__2.pdf");
        assert_eq!(sanitize_file_name("  spaced.txt  ").unwrap(), "spaced.txt");
    }

    #[test]
    fn test_sanitize_rejects_empty() {
        assert_eq!(sanitize_file_name(""), Err(NamingError::EmptyName));
        assert_eq!(sanitize_file_name("   "), Err(NamingError::EmptyName));
    }

    #[test]
    fn test_sanitize_collapses_dot_runs() {
        assert_eq!(sanitize_file_name("a..b.txt").unwrap(), "a.b.txt");
        assert_eq!(sanitize_file_name("report...pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_file_name("..hidden").unwrap(), ".hidden");
        assert_eq!(sanitize_file_name(".."), Err(NamingError::EmptyName));
        assert_eq!(sanitize_file_name("."), Err(NamingError::EmptyName));
        assert_eq!(sanitize_file_name(" ... "), Err(NamingError::EmptyName));
    }

    #[test]
    fn test_sanitize_truncation_never_joins_dots() {
        let long = format!("{}.{}.png", "a".repeat(250), "b".repeat(10));
        let sanitized = sanitize_file_name(&long).unwrap();
        assert!(!sanitized.contains(".."), "{}", sanitized);
        assert!(sanitized.ends_with(".png"));
    }

    #[test]
    fn test_sanitize_truncates_preserving_extension() {
        let long = format!("{}.jpeg", "a".repeat(400));
        let sanitized = sanitize_file_name(&long).unwrap();
        assert_eq!(sanitized.len(), MAX_FILE_NAME_LENGTH);
        assert!(sanitized.ends_with(".jpeg"));
    }

    #[test]
    fn test_resolve_probes_counter_suffix() {
        let taken: HashSet<&str> = ["a.png", "a_1.png"].into_iter().collect();
        let resolver = UniqueNameResolver::default();
        assert_eq!(
            resolver.resolve_with("a.png", |c| taken.contains(c)).unwrap(),
            "a_2.png"
        );
        assert_eq!(
            resolver.resolve_with("b.png", |c| taken.contains(c)).unwrap(),
            "b.png"
        );
    }

    #[test]
    fn test_resolve_without_extension() {
        let resolver = UniqueNameResolver::default();
        assert_eq!(
            resolver.resolve_with("README", |c| c == "README").unwrap(),
            "README_1"
        );
    }

    #[test]
    fn test_resolve_exhausted() {
        let resolver = UniqueNameResolver::with_max_attempts(3);
        assert_eq!(
            resolver.resolve_with("x.txt", |_| true),
            Err(NamingError::Exhausted {
                name: "x.txt".to_string(),
                attempts: 3
            })
        );
    }

    #[test]
    fn test_resolve_in_directory_after_materializing() {
        let temp = TempDir::new().unwrap();
        let resolver = UniqueNameResolver::default();

        let first = resolver.resolve(temp.path(), "a.png").unwrap();
        assert_eq!(first, "a.png");
        std::fs::write(temp.path().join(&first), b"x").unwrap();

        let second = resolver.resolve(temp.path(), "a.png").unwrap();
        assert_eq!(second, "a_1.png");
    }

    #[test]
    fn test_split_and_suffix() {
        assert_eq!(split_name("photo.tar.gz"), ("photo.tar", Some("gz")));
        assert_eq!(split_name(".env"), (".env", None));
        assert_eq!(with_suffix("photo.jpg", "cropped"), "photo_cropped.jpg");
        assert_eq!(with_suffix("notes", "original"), "notes_original");
    }
}
