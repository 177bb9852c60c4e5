use crate::catalog::Catalog;
use crate::client::{ClientError, TorrentClient};
use crate::marker;
use crate::tracker::{ActiveDownload, Verdict};

/// Acts on a terminal verdict: removes the job with its data, marks the
/// originating descriptor so it is never retried, and goes idle.
///
/// A failed delete leaves the state untouched so the verdict is
/// re-evaluated on the next tick.
pub async fn evict(
    client: &dyn TorrentClient,
    catalog: &Catalog<'_>,
    state: &mut ActiveDownload,
    verdict: Verdict,
) -> Result<(), ClientError> {
    let Some(marker) = verdict.marker() else {
        return Ok(());
    };
    let Some(job) = state.tracked() else {
        return Ok(());
    };
    let hash = job.hash.clone();
    let name = job.name.clone();

    client.delete_jobs(std::slice::from_ref(&hash), true).await?;
    tracing::info!(hash = %hash, name = %name, ?verdict, "tracker: evicted download and its data");

    match catalog.find_descriptor(&hash) {
        Some(path) => match marker::mark(&path, marker) {
            Ok(target) => {
                tracing::info!(hash = %hash, path = %target.display(), "tracker: descriptor marked")
            }
            Err(err) => {
                tracing::error!(hash = %hash, error = %format!("{err:#}"), "tracker: marking descriptor failed")
            }
        },
        None => tracing::warn!(hash = %hash, "tracker: originating descriptor not found in any queue"),
    }

    state.reset();
    Ok(())
}
