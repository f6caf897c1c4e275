//! File discovery module for raw instrument trees
//!
//! Walks an arbitrary directory tree below the input root, skipping
//! version-control and cache directories, and returns every file whose
//! name matches one of the configured glob patterns.

use crate::error::{Result, StagerError};
use glob::{MatchOptions, Pattern};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// File discovery component for an ingestion root
#[derive(Debug)]
pub struct FileDiscovery {
    input_root: PathBuf,
    patterns: Vec<Pattern>,
    excluded_dirs: Vec<String>,
    computer_count: usize,
}

impl FileDiscovery {
    /// Create a new file discovery instance
    pub fn new(
        input_root: PathBuf,
        file_patterns: &[String],
        excluded_dirs: &[String],
    ) -> Result<Self> {
        let patterns = file_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| StagerError::Configuration {
                    message: format!("Invalid file pattern '{}': {}", p, e),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            input_root,
            patterns,
            excluded_dirs: excluded_dirs.to_vec(),
            computer_count: 0,
        })
    }

    /// Number of distinct top-level directories holding matched files
    pub fn computer_count(&self) -> usize {
        self.computer_count
    }

    /// Discover all eligible files, sorted by path
    ///
    /// ```text
    /// input_root/
    ///   lab-pc-1/
    ///     2024-05-12/
    ///       IVg_001.csv
    ///       It_002.csv
    ///   lab-pc-2/
    ///     sweep.csv
    ///   .git/            (skipped)
    /// ```
    pub fn discover_files(&mut self) -> Result<Vec<PathBuf>> {
        if !self.input_root.is_dir() {
            return Err(StagerError::InputRootNotFound {
                path: self.input_root.clone(),
            });
        }

        debug!("Searching for raw files in: {}", self.input_root.display());

        let mut files = Vec::new();
        let mut computers = BTreeSet::new();

        let walker = WalkDir::new(&self.input_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !self.is_excluded_dir(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry during discovery: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() || !self.matches_pattern(entry.path()) {
                continue;
            }

            if let Some(first) = entry
                .path()
                .strip_prefix(&self.input_root)
                .ok()
                .filter(|rel| rel.components().count() > 1)
                .and_then(|rel| rel.components().next())
            {
                computers.insert(first.as_os_str().to_os_string());
            }
            files.push(entry.into_path());
        }

        files.sort();
        self.computer_count = computers.len();
        debug!(
            "Found {} files from {} computers",
            files.len(),
            self.computer_count
        );

        Ok(files)
    }

    fn is_excluded_dir(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| self.excluded_dirs.iter().any(|d| d == name))
    }

    fn matches_pattern(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| {
                self.patterns
                    .iter()
                    .any(|p| p.matches_with(name, MATCH_OPTIONS))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_EXCLUDED_DIRS, DEFAULT_FILE_PATTERNS};
    use std::fs;
    use tempfile::TempDir;

    fn default_discovery(root: PathBuf) -> FileDiscovery {
        let patterns: Vec<String> = DEFAULT_FILE_PATTERNS.iter().map(|s| s.to_string()).collect();
        let excluded: Vec<String> = DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect();
        FileDiscovery::new(root, &patterns, &excluded).unwrap()
    }

    /// Helper to create a test instrument tree
    fn create_test_tree(temp_dir: &TempDir) -> PathBuf {
        let root = temp_dir.path().join("raw");

        let day = root.join("lab-pc-1").join("2024-05-12");
        fs::create_dir_all(&day).unwrap();
        fs::write(day.join("IVg_001.csv"), "data").unwrap();
        fs::write(day.join("It_002.CSV"), "data").unwrap();
        fs::write(day.join("notes.txt"), "ignored").unwrap();

        let pc2 = root.join("lab-pc-2");
        fs::create_dir_all(&pc2).unwrap();
        fs::write(pc2.join("sweep.csv"), "data").unwrap();

        fs::write(root.join("loose.csv"), "data").unwrap();

        let git = root.join(".git").join("objects");
        fs::create_dir_all(&git).unwrap();
        fs::write(git.join("hidden.csv"), "ignored").unwrap();

        let checkpoints = pc2.join(".ipynb_checkpoints");
        fs::create_dir_all(&checkpoints).unwrap();
        fs::write(checkpoints.join("sweep-checkpoint.csv"), "ignored").unwrap();

        root
    }

    #[test]
    fn test_discover_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_test_tree(&temp_dir);

        let mut discovery = default_discovery(root.clone());
        let files = discovery.discover_files().unwrap();

        let rel: Vec<String> = files
            .iter()
            .map(|p| {
                p.strip_prefix(&root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();

        assert_eq!(
            rel,
            vec![
                "lab-pc-1/2024-05-12/IVg_001.csv",
                "lab-pc-1/2024-05-12/It_002.CSV",
                "lab-pc-2/sweep.csv",
                "loose.csv",
            ]
        );
        assert_eq!(discovery.computer_count(), 2);
    }

    #[test]
    fn test_discover_empty_root() {
        let temp_dir = TempDir::new().unwrap();
        let mut discovery = default_discovery(temp_dir.path().to_path_buf());
        let files = discovery.discover_files().unwrap();

        assert!(files.is_empty());
        assert_eq!(discovery.computer_count(), 0);
    }

    #[test]
    fn test_discover_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");

        let mut discovery = default_discovery(missing.clone());
        match discovery.discover_files() {
            Err(StagerError::InputRootNotFound { path }) => assert_eq!(path, missing),
            other => panic!("Expected InputRootNotFound error, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_patterns() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_test_tree(&temp_dir);

        let mut discovery =
            FileDiscovery::new(root, &["ivg_*.csv".to_string()], &[]).unwrap();
        let files = discovery.discover_files().unwrap();

        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("IVg_001.csv"));
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let result = FileDiscovery::new(PathBuf::from("."), &["[".to_string()], &[]);
        assert!(matches!(result, Err(StagerError::Configuration { .. })));
    }
}
