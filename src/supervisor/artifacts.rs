//! Output artifact naming.
//!
//! Two producers write into the shared output directory and each names files
//! its own way:
//!
//! | convention     | playlist          | segments              |
//! |----------------|-------------------|-----------------------|
//! | `Distribution` | `{name}.m3u8`     | `{name}_NNN.ts`       |
//! | `WorkerDirect` | `stream_{name}.m3u8` | `stream_{name}_NNN.ts` |
//!
//! `Distribution` is authoritative; `WorkerDirect` is kept as a compatibility
//! fallback and is always checked and purged alongside it. Every match is
//! scoped to an exact stream name so that purging `7` never touches `77` or
//! `7_123`'s files unless `7_123` is a known alias of the stream.

use std::io;
use std::path::{Path, PathBuf};

pub const PLAYLIST_EXT: &str = "m3u8";
pub const SEGMENT_EXT: &str = "ts";

/// A file naming scheme used by one of the output producers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamingConvention {
    Distribution,
    WorkerDirect,
}

impl NamingConvention {
    /// Checked in this order; the first hit wins.
    pub const ALL: [NamingConvention; 2] =
        [NamingConvention::Distribution, NamingConvention::WorkerDirect];

    fn prefix(self) -> &'static str {
        match self {
            NamingConvention::Distribution => "",
            NamingConvention::WorkerDirect => "stream_",
        }
    }

    /// Base file name (no extension) for a stream under this convention.
    pub fn stem(self, name: &str) -> String {
        format!("{}{name}", self.prefix())
    }

    pub fn playlist_name(self, name: &str) -> String {
        format!("{}.{PLAYLIST_EXT}", self.stem(name))
    }

    /// `{stem}_NNN.ts` with one or more ASCII digits.
    pub fn is_segment_of(self, name: &str, file_name: &str) -> bool {
        let Some(rest) = file_name.strip_prefix(&self.stem(name)) else {
            return false;
        };
        let Some(rest) = rest.strip_prefix('_') else {
            return false;
        };
        let Some(digits) = rest
            .strip_suffix(SEGMENT_EXT)
            .and_then(|r| r.strip_suffix('.'))
        else {
            return false;
        };
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
    }
}

/// The set of file names a stream may produce. Transient: derived from the
/// stream id (plus any sink alias) whenever it is needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactSet {
    names: Vec<String>,
}

impl ArtifactSet {
    pub fn for_stream(id: &str) -> Self {
        Self {
            names: vec![id.to_string()],
        }
    }

    /// Include the files of a disambiguated sink name.
    pub fn with_alias(mut self, alias: Option<&str>) -> Self {
        if let Some(alias) = alias {
            if !self.names.iter().any(|n| n == alias) {
                self.names.push(alias.to_string());
            }
        }
        self
    }

    /// Stream name first, then any alias.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Playlist file names in preference order.
    pub fn playlist_candidates(&self) -> Vec<String> {
        self.names
            .iter()
            .flat_map(|name| NamingConvention::ALL.map(|c| c.playlist_name(name)))
            .collect()
    }

    pub fn is_segment(&self, file_name: &str) -> bool {
        self.names.iter().any(|name| {
            NamingConvention::ALL
                .iter()
                .any(|c| c.is_segment_of(name, file_name))
        })
    }

    /// Whether `file_name` is any artifact of this stream, including a
    /// playlist's in-progress `.tmp` rewrite.
    pub fn matches(&self, file_name: &str) -> bool {
        let playlist_stem = file_name.strip_suffix(".tmp").unwrap_or(file_name);
        self.playlist_candidates().iter().any(|p| p == playlist_stem) || self.is_segment(file_name)
    }

    /// Delete every artifact of this stream in `dir`.
    ///
    /// Idempotent: a missing directory or a file that vanished mid-purge is
    /// not an error. Individual removal failures are logged and skipped so
    /// one stuck file does not keep the rest around. Returns the paths that
    /// were removed.
    pub fn purge(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut removed = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !self.matches(file_name) {
                continue;
            }
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Removed artifact");
                    removed.push(path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn segment_matching_is_scoped_to_exact_name() {
        let set = ArtifactSet::for_stream("7");
        assert!(set.is_segment("7_001.ts"));
        assert!(set.is_segment("stream_7_12.ts"));
        assert!(!set.is_segment("77_001.ts"));
        assert!(!set.is_segment("7_.ts"));
        assert!(!set.is_segment("7_abc.ts"));
        assert!(!set.is_segment("7_123_001.ts"));
        assert!(!set.is_segment("stream_77_001.ts"));
        assert!(!set.is_segment("7_001.ts.bak"));
    }

    #[test]
    fn alias_extends_matching() {
        let set = ArtifactSet::for_stream("7").with_alias(Some("7_123"));
        assert!(set.matches("7_123.m3u8"));
        assert!(set.matches("7_123_001.ts"));
        assert!(set.matches("stream_7_123.m3u8"));
        assert_eq!(
            set.playlist_candidates(),
            vec!["7.m3u8", "stream_7.m3u8", "7_123.m3u8", "stream_7_123.m3u8"]
        );
    }

    #[test]
    fn duplicate_alias_is_ignored() {
        let set = ArtifactSet::for_stream("7").with_alias(Some("7"));
        assert_eq!(set.names(), ["7"]);
    }

    #[test]
    fn purge_removes_both_conventions_only() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        for name in [
            "7.m3u8",
            "7_000.ts",
            "7_001.ts",
            "stream_7.m3u8",
            "stream_7.m3u8.tmp",
            "stream_7_000.ts",
            "77.m3u8",
            "77_000.ts",
            "8_000.ts",
            "notes.txt",
        ] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }

        let removed = ArtifactSet::for_stream("7").purge(dir).unwrap();
        assert_eq!(removed.len(), 6);

        let mut left: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, vec!["77.m3u8", "77_000.ts", "8_000.ts", "notes.txt"]);
    }

    #[test]
    fn purge_is_idempotent_and_tolerates_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let set = ArtifactSet::for_stream("7");
        assert!(set.purge(tmp.path()).unwrap().is_empty());
        assert!(set.purge(&tmp.path().join("missing")).unwrap().is_empty());
    }
}
