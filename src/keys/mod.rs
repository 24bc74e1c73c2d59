use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Immutable limits for one API key. A limit of 0 means that dimension is
/// disabled and can never be the cause of a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyLimits {
    pub api_key: String,
    pub rpm: i64,
    pub input_tpm: i64,
    pub output_tpm: i64,
}

#[derive(Debug, Deserialize)]
struct KeysFile {
    keys: HashMap<String, KeyEntry>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    request_per_minute: i64,
    input_tokens_per_minute: i64,
    output_tokens_per_minute: i64,
}

/// Loads and holds the API-key → limits mapping. Readers always see a
/// complete snapshot — old or new, never half-updated — via `ArcSwap`.
pub struct KeyRegistry {
    path: PathBuf,
    limits: ArcSwap<HashMap<String, ApiKeyLimits>>,
}

impl KeyRegistry {
    /// Load the registry from `path`. Fails fast on a missing file, malformed
    /// document, missing field, or non-integer value — the caller should
    /// treat this as a fatal startup error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let limits = Self::parse(&path)?;
        tracing::info!("keys: loaded {} api key(s) from {}", limits.len(), path.display());
        Ok(Self {
            path,
            limits: ArcSwap::new(Arc::new(limits)),
        })
    }

    fn parse(path: &Path) -> Result<HashMap<String, ApiKeyLimits>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading api keys file {}", path.display()))?;
        let doc: KeysFile = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing api keys file {}", path.display()))?;

        let mut limits = HashMap::with_capacity(doc.keys.len());
        for (api_key, entry) in doc.keys {
            limits.insert(
                api_key.clone(),
                ApiKeyLimits {
                    api_key,
                    rpm: entry.request_per_minute,
                    input_tpm: entry.input_tokens_per_minute,
                    output_tpm: entry.output_tokens_per_minute,
                },
            );
        }
        Ok(limits)
    }

    /// Look up the limits for a key, if configured.
    pub fn lookup(&self, api_key: &str) -> Option<ApiKeyLimits> {
        self.limits.load().get(api_key).cloned()
    }

    /// All configured keys' limits.
    pub fn list_all(&self) -> Vec<ApiKeyLimits> {
        self.limits.load().values().cloned().collect()
    }

    pub fn key_count(&self) -> usize {
        self.limits.load().len()
    }

    /// Full rebuild from disk, published atomically. Not required to be
    /// concurrent-safe with in-flight admissions — the host should only
    /// call this at a quiescent point.
    pub fn reload(&self) -> Result<()> {
        let limits = Self::parse(&self.path)?;
        tracing::info!("keys: reloaded {} api key(s)", limits.len());
        self.limits.store(Arc::new(limits));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_yaml(contents: &str) -> tempfile_path::TempYaml {
        tempfile_path::TempYaml::new(contents)
    }

    // Minimal temp-file helper so tests don't need an extra dev-dependency
    // for a single-purpose fixture.
    mod tempfile_path {
        use std::io::Write;
        pub struct TempYaml {
            pub path: std::path::PathBuf,
        }
        impl TempYaml {
            pub fn new(contents: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "rate-limiter-test-{}-{}.yaml",
                    std::process::id(),
                    contents.len()
                ));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents.as_bytes()).unwrap();
                Self { path }
            }
        }
        impl Drop for TempYaml {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn parses_valid_keys_file() {
        let tmp = write_temp_yaml(
            r#"
keys:
  sk-test-1:
    request_per_minute: 5
    input_tokens_per_minute: 1000
    output_tokens_per_minute: 500
"#,
        );
        let registry = KeyRegistry::load(&tmp.path).expect("should parse");
        let limits = registry.lookup("sk-test-1").expect("key present");
        assert_eq!(limits.rpm, 5);
        assert_eq!(limits.input_tpm, 1000);
        assert_eq!(limits.output_tpm, 500);
        assert_eq!(registry.key_count(), 1);
    }

    #[test]
    fn unknown_key_is_absent() {
        let tmp = write_temp_yaml(
            r#"
keys:
  sk-test-2:
    request_per_minute: 1
    input_tokens_per_minute: 1
    output_tokens_per_minute: 1
"#,
        );
        let registry = KeyRegistry::load(&tmp.path).unwrap();
        assert!(registry.lookup("sk-does-not-exist").is_none());
    }

    #[test]
    fn missing_field_fails_fast() {
        let tmp = write_temp_yaml(
            r#"
keys:
  sk-bad:
    request_per_minute: 5
"#,
        );
        assert!(KeyRegistry::load(&tmp.path).is_err());
    }

    #[test]
    fn missing_file_fails_fast() {
        assert!(KeyRegistry::load("/nonexistent/path/api_keys.yaml").is_err());
    }

    #[test]
    fn reload_replaces_snapshot() {
        let tmp = write_temp_yaml(
            r#"
keys:
  sk-a:
    request_per_minute: 1
    input_tokens_per_minute: 1
    output_tokens_per_minute: 1
"#,
        );
        let registry = KeyRegistry::load(&tmp.path).unwrap();
        assert_eq!(registry.key_count(), 1);

        let mut f = std::fs::File::create(&tmp.path).unwrap();
        f.write_all(
            br#"
keys:
  sk-a:
    request_per_minute: 2
    input_tokens_per_minute: 2
    output_tokens_per_minute: 2
  sk-b:
    request_per_minute: 3
    input_tokens_per_minute: 3
    output_tokens_per_minute: 3
"#,
        )
        .unwrap();

        registry.reload().unwrap();
        assert_eq!(registry.key_count(), 2);
        assert_eq!(registry.lookup("sk-a").unwrap().rpm, 2);
    }
}
