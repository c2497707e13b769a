//! Distribution server helpers.
//!
//! The distribution server turns published sinks into HTTP-served HLS under
//! `playback_base`. The supervisor never talks to it; these probes exist for
//! the `check` command and operators.

use std::time::Duration;

use crate::error::DistributionError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Public URL of `file_name` under the playback base.
pub fn playback_url(base: &str, file_name: &str) -> String {
    format!("{}/{file_name}", base.trim_end_matches('/'))
}

/// Verify the distribution server answers at all.
///
/// Any HTTP response counts as reachable; only transport failures are
/// errors (an index listing is usually disabled).
pub async fn probe_server(base: &str) -> Result<u16, DistributionError> {
    let url = format!("{}/", base.trim_end_matches('/'));
    let resp = reqwest::Client::new()
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|e| DistributionError::Unreachable {
            url: url.clone(),
            message: e.to_string(),
        })?;
    Ok(resp.status().as_u16())
}

/// Verify `{id}.m3u8` is being served.
pub async fn probe_playlist(base: &str, id: &str) -> Result<(), DistributionError> {
    let url = playback_url(base, &format!("{id}.m3u8"));
    let resp = reqwest::Client::new()
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|e| DistributionError::Unreachable {
            url: url.clone(),
            message: e.to_string(),
        })?;

    if !resp.status().is_success() {
        return Err(DistributionError::BadStatus {
            url,
            status: resp.status().as_u16(),
        });
    }
    Ok(())
}
