use std::time::Duration;

use url::Url;

use crate::error::{DispatchError, DispatchResult};

/// How long a new link waits for the relay's first listing.
pub(crate) const READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Fallback when the relay asks us to come back without saying when.
pub(crate) const DEFAULT_RETRY: Duration = Duration::from_secs(5);

/// Why a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Finished,
    Retry(Duration),
}

/// `base` with `segments` appended to its path.
pub(crate) fn join_path(base: &Url, segments: &[&str]) -> DispatchResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| DispatchError::Setup(format!("{base} cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) fn parse_base(base: &str) -> DispatchResult<Url> {
    Url::parse(base).map_err(|err| DispatchError::Setup(format!("invalid relay url {base}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_below_existing_path() {
        let base = parse_base("http://127.0.0.1:8090/relay/").unwrap();
        let url = join_path(&base, &["messages", "A1"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8090/relay/messages/A1");
    }

    #[test]
    fn escapes_endpoint_ids() {
        let base = parse_base("ws://localhost:1").unwrap();
        let url = join_path(&base, &["a b"]).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:1/a%20b");
    }
}
