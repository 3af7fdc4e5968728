use url::Url;

/// Scheme of the in-process transport.
pub const LOOPBACK_SCHEME: &str = "loopback";

/// Default lightweight local queue.
pub const DEFAULT_QUEUE: &str = "loopback://default";

/// Default durable local queue.
pub const DURABLE_QUEUE: &str = "loopback://durable";

/// Local queue that receives replies when no listener is marked for replies.
pub const REPLIES_QUEUE: &str = "loopback://replies";

/// Address helpers used by routing, listeners and the channel graph.
pub trait UriExt {
    /// `durable` as the host of a loopback address, or as the first path
    /// segment of any other address, marks the endpoint durable.
    fn is_durable(&self) -> bool;

    fn is_loopback(&self) -> bool;

    /// Normalized key for caching agents and looking up queues.
    fn endpoint_key(&self) -> String;
}

impl UriExt for Url {
    fn is_durable(&self) -> bool {
        if self.scheme() == LOOPBACK_SCHEME && self.host_str() == Some("durable") {
            return true;
        }
        self.path_segments()
            .and_then(|mut segments| segments.next())
            .map(|first| first.eq_ignore_ascii_case("durable"))
            .unwrap_or(false)
    }

    fn is_loopback(&self) -> bool {
        self.scheme() == LOOPBACK_SCHEME
    }

    fn endpoint_key(&self) -> String {
        self.as_str().trim_end_matches('/').to_ascii_lowercase()
    }
}

/// Build a `loopback://` address for a named local queue.
pub fn loopback_uri(queue: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("{LOOPBACK_SCHEME}://{queue}"))
}

pub(crate) fn default_queue() -> Result<Url, url::ParseError> {
    Url::parse(DEFAULT_QUEUE)
}

pub(crate) fn durable_queue() -> Result<Url, url::ParseError> {
    Url::parse(DURABLE_QUEUE)
}

pub(crate) fn replies_queue() -> Result<Url, url::ParseError> {
    Url::parse(REPLIES_QUEUE)
}
