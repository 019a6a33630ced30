//! Request interception rules: which requests the worker handles.

use casa_core::ExcludedPattern;
use http::Method;
use tracing::trace;

use crate::{Request, Url};

/// Action to take for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// The worker handles the request.
    Handle,
    /// Default network handling; the worker stays out of it.
    Passthrough,
}

/// A URL pattern, matched against the serialized URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlPattern {
    Exact(String),
    /// Scheme prefixes such as `chrome-extension:`.
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl UrlPattern {
    pub fn matches(&self, url: &Url) -> bool {
        let url = url.as_str();
        match self {
            UrlPattern::Exact(p) => url == p.as_str(),
            UrlPattern::Prefix(p) => url.starts_with(p.as_str()),
            UrlPattern::Suffix(p) => url.ends_with(p.as_str()),
            UrlPattern::Contains(p) => url.contains(p.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            UrlPattern::Exact(p)
            | UrlPattern::Prefix(p)
            | UrlPattern::Suffix(p)
            | UrlPattern::Contains(p) => p,
        }
    }
}

impl From<&ExcludedPattern> for UrlPattern {
    fn from(pattern: &ExcludedPattern) -> Self {
        match pattern {
            ExcludedPattern::Exact(p) => UrlPattern::Exact(p.clone()),
            ExcludedPattern::Prefix(p) => UrlPattern::Prefix(p.clone()),
            ExcludedPattern::Suffix(p) => UrlPattern::Suffix(p.clone()),
            ExcludedPattern::Contains(p) => UrlPattern::Contains(p.clone()),
        }
    }
}

/// Decides whether the worker intercepts a request.
///
/// Only GET requests are handled, and only when no exclusion matches.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    exclusions: Vec<UrlPattern>,
}

impl RequestFilter {
    /// Create a filter with no exclusions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter from configured exclusions.
    pub fn from_patterns(patterns: &[ExcludedPattern]) -> Self {
        Self {
            exclusions: patterns.iter().map(UrlPattern::from).collect(),
        }
    }

    /// Exclude URLs matching a pattern.
    pub fn exclude(&mut self, pattern: UrlPattern) {
        self.exclusions.push(pattern);
    }

    pub fn exclusions(&self) -> &[UrlPattern] {
        &self.exclusions
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> InterceptAction {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Not a GET, passing through");
            return InterceptAction::Passthrough;
        }

        if let Some(pattern) = self.exclusions.iter().find(|p| p.matches(&request.url)) {
            trace!(url = %request.url, pattern = pattern.as_str(), "Excluded URL, passing through");
            return InterceptAction::Passthrough;
        }

        InterceptAction::Handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use casa_core::WorkerConfig;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[test]
    fn test_url_patterns() {
        let listing = Url::parse("https://casas.example/listings/42").unwrap();
        assert!(UrlPattern::Exact("https://casas.example/listings/42".into()).matches(&listing));
        assert!(!UrlPattern::Exact("https://casas.example/".into()).matches(&listing));
        assert!(UrlPattern::Prefix("https:".into()).matches(&listing));
        assert!(UrlPattern::Suffix("/42".into()).matches(&listing));
        assert!(!UrlPattern::Suffix(".map".into()).matches(&listing));
        assert!(UrlPattern::Contains("/listings/".into()).matches(&listing));
    }

    #[test]
    fn test_patterns_from_config() {
        let pattern = UrlPattern::from(&ExcludedPattern::Contains("/rest/v1/".into()));
        assert_eq!(pattern, UrlPattern::Contains("/rest/v1/".into()));
        assert_eq!(pattern.as_str(), "/rest/v1/");
    }

    #[test]
    fn test_exact_exclusion_from_config() {
        let filter = RequestFilter::from_patterns(&[ExcludedPattern::Exact(
            "https://casas.example/sitemap.xml".into(),
        )]);

        assert_eq!(
            filter.classify(&get("https://casas.example/sitemap.xml")),
            InterceptAction::Passthrough
        );
        assert_eq!(
            filter.classify(&get("https://casas.example/sitemap.xml?page=2")),
            InterceptAction::Handle
        );
    }

    #[test]
    fn test_non_get_passes_through() {
        let filter = RequestFilter::new();
        let url = Url::parse("https://casas.example/contact").unwrap();
        let request = Request::post(url, Bytes::from_static(b"name=Ana"));
        assert_eq!(filter.classify(&request), InterceptAction::Passthrough);
    }

    #[test]
    fn test_default_exclusions() {
        let filter = RequestFilter::from_patterns(&WorkerConfig::default().excluded_patterns);

        assert_eq!(
            filter.classify(&get("chrome-extension://abcdef/inject.js")),
            InterceptAction::Passthrough
        );
        assert_eq!(
            filter.classify(&get("moz-extension://1234/content.js")),
            InterceptAction::Passthrough
        );
        assert_eq!(
            filter.classify(&get("https://casas.example/listings?city=quito")),
            InterceptAction::Handle
        );
    }

    #[test]
    fn test_custom_exclusion() {
        let mut filter = RequestFilter::new();
        filter.exclude(UrlPattern::Contains("/rest/v1/".into()));

        assert_eq!(
            filter.classify(&get("https://db.example/rest/v1/properties")),
            InterceptAction::Passthrough
        );
        assert_eq!(filter.exclusions().len(), 1);
    }
}
