//! Startup configuration.
//!
//! The configuration is read once from a TOML file, validated, and then
//! shared read-only (`Arc<Config>`) by every component. Nothing in the engine
//! reads configuration from ambient global state.
//!
//! ```toml
//! input_path = "/srv/inbox"
//! working_path = "/srv/work"
//! output_path = "/srv/outbox"
//! extensions = ["txt", "pdf"]
//! remote_prefix = "/encrypted/"
//! recipient_key = "age1..."
//!
//! [store]
//! kind = "dropbox"
//! ```

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ConfigError;

/// Default chunk size for resumable uploads: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 << 20;

/// Largest accepted chunk: the Dropbox per-request limit of 150 MiB.
pub const MAX_CHUNK_SIZE: u64 = 150 << 20;

/// Default bound on upload attempts per file.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Environment variable consulted when the Dropbox token is not in the file.
pub const TOKEN_ENV_VAR: &str = "SEALPOST_DROPBOX_TOKEN";

const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Immutable process-wide configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory tree scanned for matching files
    pub input_path: PathBuf,

    /// Working area holding staged plaintext copies
    pub working_path: PathBuf,

    /// Output area holding encrypted artifacts
    pub output_path: PathBuf,

    /// Extensions that select files for encryption (case-sensitive, no dot)
    #[serde(deserialize_with = "deserialize_extensions")]
    pub extensions: BTreeSet<String>,

    /// Prepended verbatim to the artifact name to form the remote key
    #[serde(default)]
    pub remote_prefix: String,

    /// Public key every artifact is sealed to
    pub recipient_key: RecipientKey,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Emit ASCII-armored artifacts
    #[serde(default = "default_true")]
    pub armor: bool,

    /// Authenticate the payload; age artifacts always are, so `false` only
    /// produces a warning
    #[serde(default = "default_true")]
    pub integrity_check: bool,

    /// Compare the committed object's size and content hash with the artifact
    #[serde(default = "default_true")]
    pub verify_upload: bool,

    /// Number of pipeline workers; 1 runs every file on the walking thread
    #[serde(default = "default_workers")]
    pub workers: usize,

    pub store: StoreConfig,
}

/// Remote backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Dropbox(DropboxConfig),
    Directory(DirectoryStoreConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DropboxConfig {
    /// Falls back to `SEALPOST_DROPBOX_TOKEN` when absent
    #[serde(default)]
    pub access_token: Option<Secret>,

    #[serde(default = "default_content_url")]
    pub content_url: String,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryStoreConfig {
    pub root: PathBuf,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

fn default_content_url() -> String {
    DEFAULT_CONTENT_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Accepts either a TOML array or a comma-separated string.
fn deserialize_extensions<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Extensions {
        List(Vec<String>),
        Csv(String),
    }

    let raw = match Extensions::deserialize(deserializer)? {
        Extensions::List(list) => list,
        Extensions::Csv(csv) => csv.split(',').map(str::to_string).collect(),
    };

    Ok(raw
        .iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_string())
        .filter(|ext| !ext.is_empty())
        .collect())
}

impl Config {
    /// Load a configuration file. The result still needs [`Config::validate`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Validate the configuration and prepare the filesystem for a run.
    ///
    /// # Behavior
    /// - The input root must exist and be a directory
    /// - Working and output directories are created when missing
    /// - All three directories are canonicalised and must be distinct and
    ///   not nested inside one another
    /// - The Dropbox token is resolved from the environment when absent
    ///
    /// # Errors
    /// Returns ConfigError describing the first problem found
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one extension must be configured".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} exceeds the {MAX_CHUNK_SIZE}-byte limit",
                self.chunk_size
            )));
        }
        if !self.integrity_check {
            warn!("integrity_check = false has no effect, age payloads are always authenticated");
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be positive".to_string()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive".to_string()));
        }

        match fs::metadata(&self.input_path) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(ConfigError::Invalid(format!(
                    "input_path is not a directory: {}",
                    self.input_path.display()
                )))
            }
            Err(source) => {
                return Err(ConfigError::Directory {
                    path: self.input_path.clone(),
                    source,
                })
            }
        }

        for dir in [&self.working_path, &self.output_path] {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Directory {
                path: dir.clone(),
                source,
            })?;
        }

        self.input_path = canonical(&self.input_path)?;
        self.working_path = canonical(&self.working_path)?;
        self.output_path = canonical(&self.output_path)?;

        let dirs = [
            ("input_path", &self.input_path),
            ("working_path", &self.working_path),
            ("output_path", &self.output_path),
        ];
        for (i, (name_a, a)) in dirs.iter().enumerate() {
            for (name_b, b) in dirs.iter().skip(i + 1) {
                if a.starts_with(b) || b.starts_with(a) {
                    return Err(ConfigError::Invalid(format!(
                        "{name_a} and {name_b} must be distinct, non-nested directories"
                    )));
                }
            }
        }

        if let StoreConfig::Dropbox(dropbox) = &mut self.store {
            if !self.remote_prefix.starts_with('/') {
                return Err(ConfigError::Invalid(
                    "remote_prefix must start with '/' for the dropbox store".to_string(),
                ));
            }
            if dropbox.access_token.as_ref().map_or(true, Secret::is_empty) {
                dropbox.access_token = std::env::var(TOKEN_ENV_VAR).ok().map(Secret::new);
            }
            if dropbox.access_token.as_ref().map_or(true, Secret::is_empty) {
                return Err(ConfigError::Invalid(format!(
                    "dropbox store needs access_token or {TOKEN_ENV_VAR}"
                )));
            }
        }

        Ok(())
    }

    /// True when the file's extension is in the configured set.
    ///
    /// The extension is whatever follows the last dot of the file name, so a
    /// dot-file such as `.txt` has the extension `txt`.
    pub fn matches_extension(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(OsStr::to_str)
            .and_then(|name| name.rsplit_once('.'))
            .map_or(false, |(_, ext)| self.extensions.contains(ext))
    }
}

fn canonical(path: &Path) -> Result<PathBuf, ConfigError> {
    fs::canonicalize(path).map_err(|source| ConfigError::Directory {
        path: path.to_path_buf(),
        source,
    })
}

/// Recipient public key, an age X25519 recipient (`age1...`).
///
/// `Debug` prints only a short fingerprint to keep logs compact.
#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct RecipientKey(age::x25519::Recipient);

impl RecipientKey {
    /// Parse a bech32 `age1...` recipient string.
    pub fn parse(encoded: &str) -> Result<Self, ConfigError> {
        encoded
            .trim()
            .parse::<age::x25519::Recipient>()
            .map(Self)
            .map_err(|e| ConfigError::Key(e.to_string()))
    }

    pub fn recipient(&self) -> &age::x25519::Recipient {
        &self.0
    }

    /// First 8 bytes of the SHA-256 of the encoded key, hex encoded.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.to_string().as_bytes());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<age::x25519::Recipient> for RecipientKey {
    fn from(key: age::x25519::Recipient) -> Self {
        Self(key)
    }
}

impl TryFrom<String> for RecipientKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientKey({})", self.fingerprint())
    }
}

/// In-memory secret string, wiped on drop and redacted in `Debug`.
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "age1ql3z7hjy54pw3hyww5ayyfg7zqgvc7w3j2elw8zmrj2kg5sfn9aqmcac8p";

    fn sample_toml(input: &Path, working: &Path, output: &Path, store_root: &Path) -> String {
        format!(
            r#"
input_path = '{}'
working_path = '{}'
output_path = '{}'
extensions = ["txt", ".pdf"]
remote_prefix = "/backup/"
recipient_key = "{KEY}"

[store]
kind = "directory"
root = '{}'
"#,
            input.display(),
            working.display(),
            output.display(),
            store_root.display()
        )
    }

    #[test]
    fn test_parse_applies_defaults() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        let text = sample_toml(&root.join("in"), &root.join("work"), &root.join("out"), &root.join("store"));

        let config = Config::from_toml_str(&text).expect("Failed to parse config");

        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.workers, 1);
        assert!(config.armor);
        assert!(config.integrity_check);
        assert!(config.verify_upload);
        assert_eq!(config.remote_prefix, "/backup/");
        let expected: BTreeSet<String> = ["pdf", "txt"].iter().map(|s| s.to_string()).collect();
        assert_eq!(config.extensions, expected);
        assert!(matches!(config.store, StoreConfig::Directory(_)));
    }

    #[test]
    fn test_parse_comma_separated_extensions() {
        let text = format!(
            r#"
input_path = "/a"
working_path = "/b"
output_path = "/c"
extensions = "txt, doc,,.csv"
recipient_key = "{KEY}"

[store]
kind = "dropbox"
access_token = "token"
"#
        );
        let config = Config::from_toml_str(&text).expect("Failed to parse config");
        let expected: BTreeSet<String> = ["csv", "doc", "txt"].iter().map(|s| s.to_string()).collect();
        assert_eq!(config.extensions, expected);
        match config.store {
            StoreConfig::Dropbox(dropbox) => {
                assert_eq!(dropbox.content_url, DEFAULT_CONTENT_URL);
                assert_eq!(dropbox.timeout_secs, DEFAULT_TIMEOUT_SECS);
                assert_eq!(dropbox.access_token.expect("token").expose(), "token");
            }
            other => panic!("unexpected store: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_recipient_key() {
        let text = r#"
input_path = "/a"
working_path = "/b"
output_path = "/c"
extensions = ["txt"]
recipient_key = "c2hvcnQ="

[store]
kind = "directory"
root = "/d"
"#;
        let result = Config::from_toml_str(text);
        assert!(result.is_err(), "A base64 string is not an age recipient");
    }

    #[test]
    fn test_validate_creates_and_canonicalises_dirs() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir(root.join("in")).expect("Failed to create input dir");
        let text = sample_toml(&root.join("in"), &root.join("work"), &root.join("out"), &root.join("store"));
        let mut config = Config::from_toml_str(&text).expect("Failed to parse config");

        config.validate().expect("Config should validate");

        assert!(config.working_path.is_dir());
        assert!(config.output_path.is_dir());
        assert!(config.input_path.is_absolute());
    }

    #[test]
    fn test_validate_rejects_missing_input() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        let text = sample_toml(&root.join("missing"), &root.join("work"), &root.join("out"), &root.join("store"));
        let mut config = Config::from_toml_str(&text).expect("Failed to parse config");

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nested_dirs() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir(root.join("in")).expect("Failed to create input dir");
        let text = sample_toml(&root.join("in"), &root.join("in").join("work"), &root.join("out"), &root.join("store"));
        let mut config = Config::from_toml_str(&text).expect("Failed to parse config");

        let err = config.validate().expect_err("Nested working dir must be rejected");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_matches_extension_is_case_sensitive() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        let text = sample_toml(&root.join("in"), &root.join("work"), &root.join("out"), &root.join("store"));
        let config = Config::from_toml_str(&text).expect("Failed to parse config");

        assert!(config.matches_extension(Path::new("/x/report.txt")));
        assert!(config.matches_extension(Path::new("/x/archive.tar.pdf")));
        assert!(!config.matches_extension(Path::new("/x/REPORT.TXT")));
        assert!(!config.matches_extension(Path::new("/x/image.png")));
        assert!(!config.matches_extension(Path::new("/x/txt")));
        assert!(!config.matches_extension(Path::new("/x/report.txt.bak")));
    }

    #[test]
    fn test_dot_file_takes_name_as_extension() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        let text = sample_toml(&root.join("in"), &root.join("work"), &root.join("out"), &root.join("store"));
        let config = Config::from_toml_str(&text).expect("Failed to parse config");

        assert!(config.matches_extension(Path::new("/x/.txt")));
        assert!(config.matches_extension(Path::new("/x/.hidden.pdf")));
        assert!(!config.matches_extension(Path::new("/x/.png")));
    }

    #[test]
    fn test_validate_bounds_chunk_size() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir(root.join("in")).expect("Failed to create input dir");
        let text = sample_toml(&root.join("in"), &root.join("work"), &root.join("out"), &root.join("store"));

        let mut oversized = Config::from_toml_str(&text).expect("Failed to parse config");
        oversized.chunk_size = MAX_CHUNK_SIZE + 1;
        let err = oversized.validate().expect_err("Oversized chunks must be rejected");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut largest = Config::from_toml_str(&text).expect("Failed to parse config");
        largest.chunk_size = MAX_CHUNK_SIZE;
        largest.validate().expect("The largest allowed chunk should validate");
    }

    #[test]
    fn test_secrets_are_redacted() {
        let secret = Secret::new("super-secret-token".to_string());
        assert_eq!(format!("{:?}", secret), "Secret([REDACTED])");

        let key = RecipientKey::parse(KEY).expect("Failed to parse key");
        let debug = format!("{:?}", key);
        assert!(!debug.contains(KEY));
        assert_eq!(key.fingerprint().len(), 16);
        assert_eq!(key.to_string(), KEY);
    }
}
