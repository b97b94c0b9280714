//! Request-scoped values passed explicitly into every transport call.

use tokio_util::sync::CancellationToken;

/// Host and scheme of the current request, plus its cancellation token.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Host (with port) the client addressed.
    pub host: String,
    /// Build `https` URLs.
    pub use_ssl: bool,
    token: CancellationToken,
}

impl RequestContext {
    /// Create a context with a fresh cancellation token.
    #[must_use]
    pub fn new(host: impl Into<String>, use_ssl: bool) -> Self {
        Self {
            host: host.into(),
            use_ssl,
            token: CancellationToken::new(),
        }
    }

    /// `https` or `http`.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.use_ssl { "https" } else { "http" }
    }

    /// `scheme://host`.
    #[must_use]
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme(), self.host)
    }

    /// Token cancelled when the request aborts.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels in-flight version work of this request.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once the request was aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_follows_ssl_flag() {
        assert_eq!(RequestContext::new("example.org", false).origin(), "http://example.org");
        assert_eq!(RequestContext::new("example.org:8443", true).origin(), "https://example.org:8443");
    }

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = RequestContext::new("localhost", false);
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_cancelled());
    }
}
