use crate::client::Category;
use crate::config::SourceQueue;
use crate::descriptor::{self, DescriptorError, TorrentDescriptor};
use crate::disk::{DiskGate, SpaceProbe};
use crate::marker;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Candidate {
    pub descriptor: TorrentDescriptor,
    pub path: PathBuf,
    pub category: Category,
    /// Lower is preferred.
    pub priority: usize,
}

impl Candidate {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub enum Selection {
    Admitted {
        candidate: Candidate,
        free_bytes: u64,
    },
    /// The first non-empty queue had candidates but none fit.
    Blocked {
        category: Category,
        candidates: usize,
        smallest_rejected: u64,
        free_bytes: u64,
    },
    Empty,
}

pub struct Catalog<'a> {
    queues: &'a [SourceQueue],
    preferences: &'a [String],
}

impl<'a> Catalog<'a> {
    pub fn new(queues: &'a [SourceQueue], preferences: &'a [String]) -> Self {
        Self {
            queues,
            preferences,
        }
    }

    /// Decodes every eligible descriptor in `queue`, ranked by tracker
    /// priority with file-name order breaking ties.
    pub fn scan_queue(&self, queue: &SourceQueue, known: &HashSet<String>) -> Vec<Candidate> {
        let mut out = Vec::new();
        for path in descriptor_files(&queue.dir) {
            let descriptor = match descriptor::read(&path) {
                Ok(d) => d,
                Err(DescriptorError::Io(err)) => {
                    tracing::warn!(%err, path = %path.display(), "catalog: unreadable descriptor, skipping this scan");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(%err, path = %path.display(), "catalog: undecodable descriptor, skipping this scan");
                    continue;
                }
            };
            if known.contains(&descriptor.info_hash) {
                continue;
            }
            let priority = tracker_priority(&descriptor.tracker_host, self.preferences);
            out.push(Candidate {
                descriptor,
                path,
                category: queue.category,
                priority,
            });
        }
        // Stable: equal priorities keep file-name order.
        out.sort_by_key(|c| c.priority);
        out
    }

    /// First-fit over the first queue that has any eligible descriptor.
    /// Lower-precedence queues are never used as spillover.
    pub fn select<P: SpaceProbe>(&self, known: &HashSet<String>, gate: &DiskGate<P>) -> Selection {
        for queue in self.queues {
            let candidates = self.scan_queue(queue, known);
            if candidates.is_empty() {
                continue;
            }

            let total = candidates.len();
            let mut smallest_rejected = u64::MAX;
            let mut free_bytes = 0;
            for candidate in candidates {
                let admission = gate.admit(candidate.descriptor.total_size);
                free_bytes = admission.free_bytes;
                if admission.ok {
                    return Selection::Admitted {
                        candidate,
                        free_bytes,
                    };
                }
                tracing::debug!(
                    file = %candidate.file_name(),
                    size = candidate.descriptor.total_size,
                    free = admission.free_bytes,
                    priority = candidate.priority,
                    "catalog: candidate does not fit"
                );
                smallest_rejected = smallest_rejected.min(candidate.descriptor.total_size);
            }
            return Selection::Blocked {
                category: queue.category,
                candidates: total,
                smallest_rejected,
                free_bytes,
            };
        }
        Selection::Empty
    }

    /// Eligible descriptors across every queue that the client does not know yet.
    pub fn pending_count(&self, known: &HashSet<String>) -> usize {
        self.queues
            .iter()
            .flat_map(|q| descriptor_files(&q.dir))
            .filter_map(|p| descriptor::read(&p).ok())
            .filter(|d| !known.contains(&d.info_hash))
            .count()
    }

    /// Locates the unmarked descriptor file whose info hash is `hash`.
    pub fn find_descriptor(&self, hash: &str) -> Option<PathBuf> {
        let hash = hash.to_ascii_lowercase();
        self.queues
            .iter()
            .flat_map(|q| descriptor_files(&q.dir))
            .find(|p| descriptor::read(p).is_ok_and(|d| d.info_hash == hash))
    }
}

/// Index of the first preference matching `host` (exact or as a parent
/// domain); unmatched hosts rank after every preference.
pub fn tracker_priority(host: &str, preferences: &[String]) -> usize {
    let host = host.to_ascii_lowercase();
    preferences
        .iter()
        .position(|pref| {
            let pref = pref.to_ascii_lowercase();
            !pref.is_empty() && (host == pref || host.ends_with(&format!(".{pref}")))
        })
        .unwrap_or(preferences.len())
}

/// `.torrent` files in `dir`, unmarked, sorted lexicographically by name.
fn descriptor_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) => {
            tracing::warn!(%err, dir = %dir.display(), "catalog: cannot list source queue");
            return Vec::new();
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.to_ascii_lowercase().ends_with(".torrent"))
        .filter(|n| !marker::is_marked(n))
        .collect();
    names.sort();
    names.into_iter().map(|n| dir.join(n)).collect()
}
