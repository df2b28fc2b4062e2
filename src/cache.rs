//! Local connection cache: one JSON file per pixel under the user cache
//! directory. The cache is advisory — any read or write failure degrades to
//! a miss and the caller falls back to the RPC lookup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub ip: String,
    pub status: String,
    /// SHA-256 hex digest of the SSH public key the pixel was provisioned
    /// with. A mismatch invalidates the fast path.
    #[serde(default)]
    pub key_fingerprint: String,
}

impl Entry {
    /// Whether this entry can be used without reconfirming via RPC.
    pub fn is_fast_path(&self, current_fingerprint: &str) -> bool {
        self.status == "RUNNING" && !self.ip.is_empty() && self.key_fingerprint == current_fingerprint
    }
}

/// SHA-256 hex fingerprint of an SSH public key string. Empty input yields
/// an empty fingerprint so unconfigured keys compare equal.
pub fn fingerprint(pub_key: &str) -> String {
    if pub_key.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(pub_key.trim().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    /// Opens the per-user cache, honoring XDG_CACHE_HOME with a ~/.cache
    /// fallback.
    pub fn open() -> Self {
        let dir = match std::env::var_os("XDG_CACHE_HOME") {
            Some(d) if !d.is_empty() => PathBuf::from(d),
            _ => std::env::var_os("HOME")
                .map(|h| PathBuf::from(h).join(".cache"))
                .unwrap_or_else(|| PathBuf::from(".cache")),
        };
        Self { dir: dir.join("pixels") }
    }

    /// Opens a cache rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Reads the cached entry for a pixel. Missing or malformed files are a
    /// miss.
    pub fn get(&self, name: &str) -> Option<Entry> {
        let data = std::fs::read(self.path(name)).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Writes a cache entry, best-effort. Writes go to a temp file first so
    /// a concurrent reader sees either the old or the new complete entry.
    pub fn put(&self, name: &str, entry: &Entry) {
        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        let Ok(data) = serde_json::to_vec(entry) else {
            return;
        };
        let tmp = self.dir.join(format!(".{name}.json.tmp"));
        if std::fs::write(&tmp, data).is_ok() {
            let _ = std::fs::rename(&tmp, self.path(name));
        }
    }

    /// Removes a cache entry, best-effort.
    pub fn delete(&self, name: &str) {
        let _ = std::fs::remove_file(self.path(name));
    }

    #[cfg(test)]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Entry {
        Entry {
            ip: "10.0.0.5".into(),
            status: "RUNNING".into(),
            key_fingerprint: fingerprint("ssh-ed25519 AAAA test@host"),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::at(dir.path());
        cache.put("mybox", &entry());
        assert_eq!(cache.get("mybox"), Some(entry()));
    }

    #[test]
    fn get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::at(dir.path());
        assert_eq!(cache.get("nope"), None);
    }

    #[test]
    fn get_malformed_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::at(dir.path());
        std::fs::create_dir_all(cache.dir()).unwrap();
        std::fs::write(cache.dir().join("bad.json"), b"{not json").unwrap();
        assert_eq!(cache.get("bad"), None);
    }

    #[test]
    fn delete_then_get_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::at(dir.path());
        cache.put("mybox", &entry());
        cache.delete("mybox");
        assert_eq!(cache.get("mybox"), None);
    }

    #[test]
    fn delete_missing_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        Cache::at(dir.path()).delete("never-existed");
    }

    #[test]
    fn fast_path_requires_running_ip_and_fingerprint() {
        let fp = fingerprint("key");
        let e = Entry { ip: "10.0.0.5".into(), status: "RUNNING".into(), key_fingerprint: fp.clone() };
        assert!(e.is_fast_path(&fp));
        assert!(!e.is_fast_path(&fingerprint("other key")));

        let stopped = Entry { status: "STOPPED".into(), ..e.clone() };
        assert!(!stopped.is_fast_path(&fp));

        let no_ip = Entry { ip: String::new(), ..e };
        assert!(!no_ip.is_fast_path(&fp));
    }

    #[test]
    fn fingerprint_is_stable_and_empty_for_empty() {
        assert_eq!(fingerprint(""), "");
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        // Trailing whitespace does not change the fingerprint.
        assert_eq!(fingerprint("abc\n"), fingerprint("abc"));
    }
}
