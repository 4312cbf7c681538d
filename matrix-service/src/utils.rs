// Utility Functions
// Path resolution and naming helpers shared across the service

use std::path::{Path, PathBuf};

/// Find the root of a git repository by walking up from the given starting path.
///
/// Traverses ancestor directories looking for a `.git` directory. Returns
/// `None` if the path is not inside a git repository.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    for ancestor in start.ancestors() {
        if ancestor.join(".git").exists() {
            return Some(ancestor.to_path_buf());
        }
    }
    None
}

/// Resolve the checkout root used as every worker's working directory.
///
/// Attempts to find the git repository root from the current directory and
/// falls back to the current directory itself.
pub fn resolve_working_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd).unwrap_or(cwd)
}

/// Default root for per-worker scratch directories
pub fn default_scratch_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("matrix-runner")
        .join("workers")
}

/// Turn an arbitrary name into an environment variable key.
///
/// `python-version` becomes `PYTHON_VERSION`.
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Turn a display name into something safe to use as a file name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("job");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn test_find_repo_root_with_git_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join(".git")).unwrap();

        let sub = root.join("a").join("b");
        fs::create_dir_all(&sub).unwrap();

        let found = find_repo_root(&sub).unwrap();
        assert_eq!(
            found.canonicalize().unwrap(),
            root.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_find_repo_root_nonexistent_path() {
        assert!(find_repo_root(Path::new("/nonexistent/path/for/matrix")).is_none());
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("python-version"), "PYTHON_VERSION");
        assert_eq!(env_key("os"), "OS");
        assert_eq!(env_key("node.js"), "NODE_JS");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(
            slugify("integration (3.10.x, macos-latest)"),
            "integration-3.10.x-macos-latest"
        );
        assert_eq!(slugify("***"), "job");
    }
}
