//! Stubs: a list of matchers plus the fixed response returned when all of
//! them pass.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::client::Control;
use crate::error::ClientError;
use crate::matcher::{BodyMatcher, HeaderMatcher, Matcher, MethodMatcher, PathPrefixMatcher, Request};
use crate::wire::Headers;

/// Identity of a registered stub within one client.
pub type StubId = u64;

/// The reply a stub sends back for a matching request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    pub header: Headers,
}

impl Response {
    /// Empty response with `status`.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            header: Headers::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header value.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.entry(name.into()).or_default().push(value.into());
        self
    }
}

/// A registered stub. Matches when every matcher passes; with no matchers
/// it matches every request.
pub(crate) struct Stub {
    matchers: Vec<Box<dyn Matcher>>,
    pub(crate) response: Response,
}

impl Stub {
    pub(crate) fn matches(&self, request: &Request) -> bool {
        self.matchers.iter().all(|m| m.matches(request))
    }
}

/// Builds a stub. Finish with [`returns`](Self::returns) or
/// [`returns_json`](Self::returns_json) to register it.
#[must_use = "a stub is only registered once `returns` or `returns_json` is awaited"]
pub struct StubBuilder {
    control: mpsc::Sender<Control>,
    matchers: Vec<Box<dyn Matcher>>,
}

impl StubBuilder {
    pub(crate) fn new(control: mpsc::Sender<Control>) -> Self {
        Self {
            control,
            matchers: Vec::new(),
        }
    }

    /// Add a custom matcher.
    pub fn matcher(mut self, matcher: impl Matcher) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    /// Match the request method, ignoring case.
    pub fn method(self, method: impl Into<String>) -> Self {
        self.matcher(MethodMatcher(method.into()))
    }

    pub fn method_get(self) -> Self {
        self.method("GET")
    }

    pub fn method_post(self) -> Self {
        self.method("POST")
    }

    pub fn method_put(self) -> Self {
        self.method("PUT")
    }

    pub fn method_patch(self) -> Self {
        self.method("PATCH")
    }

    pub fn method_delete(self) -> Self {
        self.method("DELETE")
    }

    /// Match when header `name` has first value `value`.
    pub fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.matcher(HeaderMatcher {
            name: name.into(),
            value: value.into(),
        })
    }

    /// Match when the decoded request path starts with `prefix`.
    pub fn path(self, prefix: impl Into<String>) -> Self {
        self.matcher(PathPrefixMatcher(prefix.into()))
    }

    /// Match when `predicate` accepts the request body.
    pub fn body(self, predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.matcher(BodyMatcher::new(predicate))
    }

    /// Register the stub with `response` and return a handle that removes it.
    pub async fn returns(self, response: Response) -> Result<StubHandle, ClientError> {
        let stub = Stub {
            matchers: self.matchers,
            response,
        };
        let (ack, registered) = oneshot::channel();
        self.control
            .send(Control::Add { stub, ack })
            .await
            .map_err(|_| ClientError::Closed)?;
        let id = registered.await.map_err(|_| ClientError::Closed)?;
        Ok(StubHandle {
            id,
            control: self.control,
        })
    }

    /// Register the stub with a JSON body serialized from `payload`.
    pub async fn returns_json<T: Serialize + ?Sized>(
        self,
        status: u16,
        payload: &T,
    ) -> Result<StubHandle, ClientError> {
        let body = serde_json::to_vec(payload)?;
        self.returns(
            Response::new(status)
                .with_header("Content-Type", "application/json")
                .with_body(body),
        )
        .await
    }
}

/// Handle to a registered stub.
///
/// Dropping the handle leaves the stub registered; call
/// [`release`](Self::release) to remove it.
#[derive(Debug)]
pub struct StubHandle {
    id: StubId,
    control: mpsc::Sender<Control>,
}

impl StubHandle {
    pub fn id(&self) -> StubId {
        self.id
    }

    /// Remove the stub. Requests forwarded after this returns no longer see it.
    pub async fn release(self) -> Result<(), ClientError> {
        let (ack, removed) = oneshot::channel();
        self.control
            .send(Control::Remove { id: self.id, ack })
            .await
            .map_err(|_| ClientError::Closed)?;
        removed.await.map_err(|_| ClientError::Closed)
    }
}
