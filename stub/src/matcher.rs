//! Request predicates used to decide whether a stub answers a request.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::wire::{Headers, RequestFrame};

/// A forwarded request as seen by matchers.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Request-target resolved against `http://localhost`.
    pub url: Url,
    pub header: Headers,
    pub body: Vec<u8>,
    path: String,
}

impl Request {
    /// Build a matcher view from a forwarded request.
    pub fn new(
        method: impl Into<String>,
        target: &str,
        header: Headers,
        body: Vec<u8>,
    ) -> Result<Self, url::ParseError> {
        let url = Url::parse(&format!("http://localhost{target}"))?;
        let path = percent_decode_str(url.path())
            .decode_utf8_lossy()
            .into_owned();
        Ok(Self {
            method: method.into(),
            url,
            header,
            body,
            path,
        })
    }

    pub(crate) fn from_frame(frame: &RequestFrame) -> Result<Self, url::ParseError> {
        Self::new(
            frame.method.clone(),
            &frame.url,
            frame.header.clone(),
            frame.body.clone(),
        )
    }

    /// Percent-decoded path, without the query.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }
}

/// A pure predicate over a forwarded request.
///
/// Any `Fn(&Request) -> bool` closure is a matcher.
pub trait Matcher: Send + Sync + 'static {
    fn matches(&self, request: &Request) -> bool;
}

impl<F> Matcher for F
where
    F: Fn(&Request) -> bool + Send + Sync + 'static,
{
    fn matches(&self, request: &Request) -> bool {
        self(request)
    }
}

/// Matches the request method, ignoring case.
#[derive(Debug, Clone)]
pub struct MethodMatcher(pub String);

impl Matcher for MethodMatcher {
    fn matches(&self, request: &Request) -> bool {
        self.0.eq_ignore_ascii_case(&request.method)
    }
}

/// Matches when the first value of a header equals `value` exactly. A
/// missing header never matches.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    pub name: String,
    pub value: String,
}

impl Matcher for HeaderMatcher {
    fn matches(&self, request: &Request) -> bool {
        request.header(&self.name) == Some(self.value.as_str())
    }
}

/// Matches when the decoded path starts with the prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher(pub String);

impl Matcher for PathPrefixMatcher {
    fn matches(&self, request: &Request) -> bool {
        request.path().starts_with(self.0.as_str())
    }
}

/// Matches when the predicate accepts the raw body.
pub struct BodyMatcher(Box<dyn Fn(&[u8]) -> bool + Send + Sync>);

impl BodyMatcher {
    pub fn new(predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Self(Box::new(predicate))
    }
}

impl fmt::Debug for BodyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BodyMatcher(..)")
    }
}

impl Matcher for BodyMatcher {
    fn matches(&self, request: &Request) -> bool {
        (self.0)(&request.body)
    }
}
