/// Collaborator contracts consumed by the engine
///
/// The catalog lookup and save-path resolution services live outside the
/// engine; these traits are the seam. Test instances are injected the same
/// way the production ones are.
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Metadata the catalog knows about an item.
#[derive(Debug, Clone, Default)]
pub struct CatalogFileInfo {
    pub url: Option<String>,
    pub title: Option<String>,
}

/// Resolves catalog item ids to URLs and folder ancestry.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn get_file_info(&self, catalog_id: i64) -> Option<CatalogFileInfo>;

    /// Ancestor folder names, outermost first. Used when a download
    /// preserves the catalog folder structure.
    async fn get_ancestor_path(&self, catalog_id: i64) -> Vec<String>;
}

/// Result of filename validation.
#[derive(Debug, Clone)]
pub struct FilenameCheck {
    pub valid: bool,
    pub sanitized: Option<String>,
}

/// Builds and validates sanitized absolute target paths.
pub trait SavePathResolver: Send + Sync {
    fn validate_filename(&self, name: &str) -> FilenameCheck;

    fn build_save_path(
        &self,
        base: &Path,
        title: &str,
        preserve_structure: bool,
        relative: &[String],
    ) -> Result<PathBuf, String>;
}

/// Default resolver: sanitizes every segment and keeps the result inside
/// the base directory.
#[derive(Debug, Default)]
pub struct SanitizingPathResolver;

impl SavePathResolver for SanitizingPathResolver {
    fn validate_filename(&self, name: &str) -> FilenameCheck {
        if name.is_empty() {
            return FilenameCheck {
                valid: false,
                sanitized: None,
            };
        }
        let sanitized = sanitize_filename::sanitize(name);
        FilenameCheck {
            valid: sanitized == name,
            sanitized: if sanitized.is_empty() {
                None
            } else {
                Some(sanitized)
            },
        }
    }

    fn build_save_path(
        &self,
        base: &Path,
        title: &str,
        preserve_structure: bool,
        relative: &[String],
    ) -> Result<PathBuf, String> {
        let filename = sanitize_filename::sanitize(title);
        if filename.is_empty() {
            return Err(format!("title {title:?} sanitizes to an empty filename"));
        }

        let mut path = base.to_path_buf();
        if preserve_structure {
            for segment in relative {
                let clean = sanitize_filename::sanitize(segment);
                if !clean.is_empty() {
                    path.push(clean);
                }
            }
        }
        path.push(filename);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_filename() {
        let resolver = SanitizingPathResolver;
        let ok = resolver.validate_filename("game.zip");
        assert!(ok.valid);

        let bad = resolver.validate_filename("../../etc/passwd");
        assert!(!bad.valid);
        // separators are gone, so the result is a single path component
        assert!(!bad.sanitized.unwrap().contains('/'));
    }

    #[test]
    fn test_build_save_path_flat() {
        let resolver = SanitizingPathResolver;
        let path = resolver
            .build_save_path(Path::new("/downloads"), "game.zip", false, &[])
            .unwrap();
        assert_eq!(path, PathBuf::from("/downloads/game.zip"));
    }

    #[test]
    fn test_build_save_path_preserves_structure() {
        let resolver = SanitizingPathResolver;
        let ancestors = vec!["Consoles".to_string(), "PS2/../..".to_string()];
        let path = resolver
            .build_save_path(Path::new("/downloads"), "game.zip", true, &ancestors)
            .unwrap();
        assert!(path.starts_with("/downloads/Consoles"));
        // sanitized segments cannot traverse out of the base
        assert!(crate::utils::filesystem::path_is_within(
            Path::new("/downloads"),
            &path
        ));
        assert_eq!(path.file_name().unwrap(), "game.zip");
    }
}
