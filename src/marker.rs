use anyhow::Context;
use std::path::{Path, PathBuf};

/// Durable "do not retry" marker appended to an evicted descriptor's name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    /// Timed out or failed an early-abandonment checkpoint.
    Slow,
    /// Never received any data.
    Dead,
}

impl Marker {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Slow => ".slow",
            Self::Dead => ".dead",
        }
    }
}

/// A marker anywhere in the name disqualifies the file, since a re-rename
/// may have appended further suffixes after it.
pub fn is_marked(file_name: &str) -> bool {
    file_name.contains(Marker::Slow.suffix()) || file_name.contains(Marker::Dead.suffix())
}

/// First free name of the form `<name><suffix>`, `<name><suffix>.1`, ...
pub fn marked_path(path: &Path, marker: Marker) -> anyhow::Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("descriptor path has no usable file name: {}", path.display()))?;
    let base = format!("{name}{}", marker.suffix());
    let mut candidate = path.with_file_name(&base);
    let mut n = 1u32;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{base}.{n}"));
        n += 1;
    }
    Ok(candidate)
}

pub fn mark(path: &Path, marker: Marker) -> anyhow::Result<PathBuf> {
    let target = marked_path(path, marker)?;
    std::fs::rename(path, &target)
        .with_context(|| format!("rename {} -> {}", path.display(), target.display()))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_dir;

    #[test]
    fn marker_anywhere_in_name_counts() {
        assert!(is_marked("a.torrent.slow"));
        assert!(is_marked("a.torrent.dead.1"));
        assert!(is_marked("a.slow.torrent"));
        assert!(!is_marked("a.torrent"));
        assert!(!is_marked("slowpoke.torrent"));
    }

    #[test]
    fn mark_appends_suffix_and_disambiguates() {
        let dir = temp_dir("marker");
        let first = dir.join("x.torrent");
        std::fs::write(&first, b"one").unwrap();
        let marked = mark(&first, Marker::Slow).unwrap();
        assert_eq!(marked, dir.join("x.torrent.slow"));
        assert!(!first.exists());

        std::fs::write(&first, b"two").unwrap();
        let marked = mark(&first, Marker::Slow).unwrap();
        assert_eq!(marked, dir.join("x.torrent.slow.1"));
        assert_eq!(std::fs::read(&marked).unwrap(), b"two");

        std::fs::write(&first, b"three").unwrap();
        assert_eq!(mark(&first, Marker::Dead).unwrap(), dir.join("x.torrent.dead"));
    }
}
