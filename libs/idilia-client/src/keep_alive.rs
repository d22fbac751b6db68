//! Keep-alive lease of pooled connections.

use http::HeaderMap;
use std::time::Duration;

const TIMEOUT_PREFIX: &str = "timeout=";

/// Lease announced by the server in a `Keep-Alive: timeout=N, max=M` header
///
/// Only the form with a leading `timeout=` followed by a comma is recognised.
/// Any other shape, a negative or a non-numeric value yields `None`, in which
/// case the pool default applies.
#[must_use]
pub fn keep_alive_duration(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("keep-alive")?.to_str().ok()?;
    let rest = value.strip_prefix(TIMEOUT_PREFIX)?;
    let (secs, _) = rest.split_once(',')?;
    secs.trim().parse::<u64>().ok().map(Duration::from_secs)
}
