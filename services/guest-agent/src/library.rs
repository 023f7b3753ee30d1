//! Extension library layout and installed-version discovery.
//!
//! Each installed extension version lives in `<lib>/<name>-<version>`. The
//! handler manifest may sit anywhere below that directory; we use the
//! shallowest `HandlerManifest.json` found.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

pub const HANDLER_MANIFEST_FILE: &str = "HandlerManifest.json";

/// A version string compared component-wise: runs of digits numerically,
/// runs of letters lexically, with numbers ordering before letters.
#[derive(Debug, Clone)]
pub struct LooseVersion {
    raw: String,
    components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Component {
    Num(u64),
    Text(String),
}

impl LooseVersion {
    pub fn parse(raw: &str) -> Self {
        let mut components = Vec::new();
        let mut chars = raw.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                let mut run = String::new();
                while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    run.push(d);
                    chars.next();
                }
                let component = match run.parse() {
                    Ok(n) => Component::Num(n),
                    Err(_) => Component::Text(run),
                };
                components.push(component);
            } else if c == '.' {
                chars.next();
            } else {
                let mut run = String::new();
                while let Some(&t) = chars.peek().filter(|t| !t.is_ascii_digit() && **t != '.') {
                    run.push(t);
                    chars.next();
                }
                components.push(Component::Text(run));
            }
        }
        Self {
            raw: raw.to_string(),
            components,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Everything before the first `.`.
    pub fn major(&self) -> &str {
        self.raw.split('.').next().unwrap_or("")
    }
}

impl PartialEq for LooseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for LooseVersion {}

impl PartialOrd for LooseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LooseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl fmt::Display for LooseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// An extension version found on disk.
#[derive(Debug, Clone)]
pub struct InstalledVersion {
    pub name: String,
    pub version: LooseVersion,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Library {
    root: PathBuf,
}

impl Library {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handler_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(format!("{name}-{version}"))
    }

    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    /// Every `<name>-<version>` directory for `name`.
    pub fn installed_versions(&self, name: &str) -> Vec<InstalledVersion> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.root.display(), error = %e, "Unable to scan extension library");
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let (dir_name, version) = file_name.to_str()?.rsplit_once('-')?;
                (dir_name == name && !version.is_empty()).then(|| InstalledVersion {
                    name: dir_name.to_string(),
                    version: LooseVersion::parse(version),
                    path: entry.path(),
                })
            })
            .collect()
    }

    /// Highest installed version of `name`, if any.
    pub fn latest_installed(&self, name: &str) -> Option<InstalledVersion> {
        self.installed_versions(name)
            .into_iter()
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Path of the shallowest `HandlerManifest.json` below `dir`.
    pub fn find_manifest(dir: &Path) -> Option<PathBuf> {
        WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == HANDLER_MANIFEST_FILE)
            .min_by_key(|entry| entry.depth())
            .map(|entry| entry.into_path())
    }

    /// Directory holding the handler manifest below `dir`.
    pub fn find_manifest_dir(dir: &Path) -> Option<PathBuf> {
        Self::find_manifest(dir).and_then(|path| path.parent().map(Path::to_path_buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    #[rstest]
    #[case("1.0", "2.0", Ordering::Less)]
    #[case("1.10", "1.9", Ordering::Greater)]
    #[case("1.0.0", "1.0", Ordering::Greater)]
    #[case("1.0", "1.0", Ordering::Equal)]
    #[case("1.0a", "1.0", Ordering::Greater)]
    #[case("1.0", "1.a", Ordering::Less)]
    #[case("2.0.12", "10.0", Ordering::Less)]
    fn loose_version_ordering(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(LooseVersion::parse(a).cmp(&LooseVersion::parse(b)), expected);
    }

    #[test]
    fn major_is_first_dotted_component() {
        assert_eq!(LooseVersion::parse("3.14.1").major(), "3");
        assert_eq!(LooseVersion::parse("7").major(), "7");
    }

    #[test]
    fn finds_highest_installed_version_of_exact_name() {
        let lib = TempDir::new().unwrap();
        for dir in ["Foo-1.0", "Foo-1.10", "Foo-1.9", "FooBar-9.0", "Other-3.0"] {
            fs::create_dir(lib.path().join(dir)).unwrap();
        }
        fs::write(lib.path().join("Foo-5.0.zip"), b"").unwrap();

        let library = Library::new(lib.path());
        let latest = library.latest_installed("Foo").unwrap();
        assert_eq!(latest.version.as_str(), "1.10");
        assert_eq!(latest.path, lib.path().join("Foo-1.10"));
        assert_eq!(library.installed_versions("Foo").len(), 3);
        assert!(library.latest_installed("Missing").is_none());
    }

    #[test]
    fn hyphenated_names_split_at_last_hyphen() {
        let lib = TempDir::new().unwrap();
        fs::create_dir(lib.path().join("Microsoft.OSTCExtensions.Custom-Script-1.2")).unwrap();

        let library = Library::new(lib.path());
        let found = library
            .latest_installed("Microsoft.OSTCExtensions.Custom-Script")
            .unwrap();
        assert_eq!(found.version.as_str(), "1.2");
    }

    #[test]
    fn manifest_lookup_prefers_shallowest() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/nested")).unwrap();
        fs::write(dir.path().join("a/nested").join(HANDLER_MANIFEST_FILE), b"[]").unwrap();
        fs::create_dir_all(dir.path().join("z")).unwrap();
        fs::write(dir.path().join("z").join(HANDLER_MANIFEST_FILE), b"[]").unwrap();

        assert_eq!(
            Library::find_manifest_dir(dir.path()),
            Some(dir.path().join("z"))
        );
        assert!(Library::find_manifest(&dir.path().join("missing")).is_none());
    }
}
