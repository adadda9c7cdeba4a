//! Priority-ordered interceptor lists
//!
//! Three independent lists (request, response, error). Each is stable-sorted
//! by priority after every insertion, lower priority first, ties in insertion
//! order. Execution works on a snapshot, so handlers may add or remove
//! interceptors without deadlocking the chain.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use netguard_domain::{NetError, NetRequest, NetResponse};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::context::CallContext;

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: NetRequest, ctx: &mut CallContext) -> Result<NetRequest, NetError>;
}

#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, response: NetResponse, ctx: &mut CallContext) -> Result<NetResponse, NetError>;
}

/// What an error handler decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDisposition {
    /// Stop the chain; the call succeeds with this response.
    Recovered(NetResponse),
    /// Hand this (possibly modified) error to the next handler.
    Continue(NetError),
}

#[async_trait]
pub trait ErrorHandler: Send + Sync {
    fn can_handle(&self, _error: &NetError) -> bool {
        true
    }

    /// `Err` means the handler itself broke; the chain skips it and keeps the
    /// error it was given.
    async fn handle(&self, error: NetError, ctx: &mut CallContext) -> Result<ErrorDisposition, NetError>;
}

/// Result of running the error chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorOutcome {
    Recovered(NetResponse),
    Failed(NetError),
}

impl ErrorOutcome {
    pub fn into_result(self) -> Result<NetResponse, NetError> {
        match self {
            Self::Recovered(response) => Ok(response),
            Self::Failed(error) => Err(error),
        }
    }
}

pub type FailureCallback = Arc<dyn Fn(&NetError, &CallContext) + Send + Sync>;

/// One registered interceptor.
pub struct Interceptor<H: ?Sized> {
    pub name: String,
    /// Lower runs earlier.
    pub priority: i32,
    pub enabled: bool,
    pub handler: Arc<H>,
    pub on_failure: Option<FailureCallback>,
}

pub type RequestInterceptor = Interceptor<dyn RequestHandler>;
pub type ResponseInterceptor = Interceptor<dyn ResponseHandler>;
pub type ErrorInterceptor = Interceptor<dyn ErrorHandler>;

impl<H: ?Sized> Clone for Interceptor<H> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            priority: self.priority,
            enabled: self.enabled,
            handler: Arc::clone(&self.handler),
            on_failure: self.on_failure.clone(),
        }
    }
}

impl<H: ?Sized> fmt::Debug for Interceptor<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl<H: ?Sized> Interceptor<H> {
    pub fn from_arc(name: impl Into<String>, priority: i32, handler: Arc<H>) -> Self {
        Self { name: name.into(), priority, enabled: true, handler, on_failure: None }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn on_failure(
        mut self,
        callback: impl Fn(&NetError, &CallContext) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    fn fire_failure(&self, error: &NetError, ctx: &CallContext) {
        if let Some(callback) = &self.on_failure {
            callback(error, ctx);
        }
    }
}

impl RequestInterceptor {
    pub fn request(name: impl Into<String>, priority: i32, handler: impl RequestHandler + 'static) -> Self {
        Self::from_arc(name, priority, Arc::new(handler))
    }

    /// Synchronous transform.
    pub fn request_fn<F>(name: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: Fn(NetRequest, &mut CallContext) -> Result<NetRequest, NetError> + Send + Sync + 'static,
    {
        Self::request(name, priority, FnHandler(f))
    }
}

impl ResponseInterceptor {
    pub fn response(name: impl Into<String>, priority: i32, handler: impl ResponseHandler + 'static) -> Self {
        Self::from_arc(name, priority, Arc::new(handler))
    }

    pub fn response_fn<F>(name: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: Fn(NetResponse, &mut CallContext) -> Result<NetResponse, NetError> + Send + Sync + 'static,
    {
        Self::response(name, priority, FnHandler(f))
    }
}

impl ErrorInterceptor {
    pub fn error(name: impl Into<String>, priority: i32, handler: impl ErrorHandler + 'static) -> Self {
        Self::from_arc(name, priority, Arc::new(handler))
    }

    pub fn error_fn<F>(name: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: Fn(NetError, &mut CallContext) -> Result<ErrorDisposition, NetError> + Send + Sync + 'static,
    {
        Self::error(name, priority, FnHandler(f))
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(NetRequest, &mut CallContext) -> Result<NetRequest, NetError> + Send + Sync,
{
    async fn handle(&self, request: NetRequest, ctx: &mut CallContext) -> Result<NetRequest, NetError> {
        (self.0)(request, ctx)
    }
}

#[async_trait]
impl<F> ResponseHandler for FnHandler<F>
where
    F: Fn(NetResponse, &mut CallContext) -> Result<NetResponse, NetError> + Send + Sync,
{
    async fn handle(&self, response: NetResponse, ctx: &mut CallContext) -> Result<NetResponse, NetError> {
        (self.0)(response, ctx)
    }
}

#[async_trait]
impl<F> ErrorHandler for FnHandler<F>
where
    F: Fn(NetError, &mut CallContext) -> Result<ErrorDisposition, NetError> + Send + Sync,
{
    async fn handle(&self, error: NetError, ctx: &mut CallContext) -> Result<ErrorDisposition, NetError> {
        (self.0)(error, ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Request,
    Response,
    Error,
}

/// Returned at registration; removes exactly that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorHandle {
    pub phase: Phase,
    id: u64,
}

struct Slot<H: ?Sized> {
    id: u64,
    interceptor: Interceptor<H>,
}

type List<H> = RwLock<Vec<Slot<H>>>;

/// Ordered interceptor lists for the three phases.
#[derive(Default)]
pub struct InterceptorChain {
    request: List<dyn RequestHandler>,
    response: List<dyn ResponseHandler>,
    error: List<dyn ErrorHandler>,
    next_id: AtomicU64,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("request", &self.names(Phase::Request))
            .field("response", &self.names(Phase::Response))
            .field("error", &self.names(Phase::Error))
            .finish()
    }
}

fn insert<H: ?Sized>(list: &List<H>, id: u64, interceptor: Interceptor<H>) {
    let mut slots = list.write();
    if let Some(pos) = slots.iter().position(|s| s.interceptor.name == interceptor.name) {
        debug!(name = %interceptor.name, "Replacing interceptor with the same name");
        slots.remove(pos);
    }
    slots.push(Slot { id, interceptor });
    slots.sort_by_key(|s| s.interceptor.priority);
}

fn snapshot<H: ?Sized>(list: &List<H>) -> Vec<Interceptor<H>> {
    list.read().iter().filter(|s| s.interceptor.enabled).map(|s| s.interceptor.clone()).collect()
}

fn remove_name<H: ?Sized>(list: &List<H>, name: &str) -> bool {
    let mut slots = list.write();
    let before = slots.len();
    slots.retain(|s| s.interceptor.name != name);
    slots.len() != before
}

fn toggle<H: ?Sized>(list: &List<H>, name: &str, enabled: bool) -> bool {
    let mut slots = list.write();
    let mut found = false;
    for slot in slots.iter_mut().filter(|s| s.interceptor.name == name) {
        slot.interceptor.enabled = enabled;
        found = true;
    }
    found
}

fn names_of<H: ?Sized>(list: &List<H>) -> Vec<String> {
    list.read().iter().map(|s| s.interceptor.name.clone()).collect()
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handle(&self, phase: Phase) -> InterceptorHandle {
        InterceptorHandle { phase, id: self.next_id.fetch_add(1, Ordering::Relaxed) }
    }

    /// A registration with an existing name replaces it.
    pub fn add_request_interceptor(&self, interceptor: RequestInterceptor) -> InterceptorHandle {
        let handle = self.next_handle(Phase::Request);
        insert(&self.request, handle.id, interceptor);
        handle
    }

    pub fn add_response_interceptor(&self, interceptor: ResponseInterceptor) -> InterceptorHandle {
        let handle = self.next_handle(Phase::Response);
        insert(&self.response, handle.id, interceptor);
        handle
    }

    pub fn add_error_interceptor(&self, interceptor: ErrorInterceptor) -> InterceptorHandle {
        let handle = self.next_handle(Phase::Error);
        insert(&self.error, handle.id, interceptor);
        handle
    }

    /// Returns false when the registration is already gone.
    pub fn remove(&self, handle: InterceptorHandle) -> bool {
        fn by_id<H: ?Sized>(list: &List<H>, id: u64) -> bool {
            let mut slots = list.write();
            let before = slots.len();
            slots.retain(|s| s.id != id);
            slots.len() != before
        }
        match handle.phase {
            Phase::Request => by_id(&self.request, handle.id),
            Phase::Response => by_id(&self.response, handle.id),
            Phase::Error => by_id(&self.error, handle.id),
        }
    }

    /// Remove `name` from every phase.
    pub fn remove_by_name(&self, name: &str) -> bool {
        let a = remove_name(&self.request, name);
        let b = remove_name(&self.response, name);
        let c = remove_name(&self.error, name);
        a || b || c
    }

    /// Toggle `name` in every phase. Returns false if it is not registered.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let a = toggle(&self.request, name, enabled);
        let b = toggle(&self.response, name, enabled);
        let c = toggle(&self.error, name, enabled);
        a || b || c
    }

    /// Registered names in execution order, disabled ones included.
    pub fn names(&self, phase: Phase) -> Vec<String> {
        match phase {
            Phase::Request => names_of(&self.request),
            Phase::Response => names_of(&self.response),
            Phase::Error => names_of(&self.error),
        }
    }

    /// Thread `request` through every enabled request interceptor.
    ///
    /// # Errors
    /// The first interceptor failure, after its failure callback ran.
    pub async fn execute_request_chain(
        &self,
        mut request: NetRequest,
        ctx: &mut CallContext,
    ) -> Result<NetRequest, NetError> {
        for interceptor in snapshot(&self.request) {
            match interceptor.handler.handle(request, ctx).await {
                Ok(next) => request = next,
                Err(err) => {
                    debug!(interceptor = %interceptor.name, error = %err, "Request interceptor failed");
                    interceptor.fire_failure(&err, ctx);
                    return Err(err);
                }
            }
        }
        Ok(request)
    }

    /// # Errors
    /// The first interceptor failure, after its failure callback ran.
    pub async fn execute_response_chain(
        &self,
        mut response: NetResponse,
        ctx: &mut CallContext,
    ) -> Result<NetResponse, NetError> {
        for interceptor in snapshot(&self.response) {
            match interceptor.handler.handle(response, ctx).await {
                Ok(next) => response = next,
                Err(err) => {
                    debug!(interceptor = %interceptor.name, error = %err, "Response interceptor failed");
                    interceptor.fire_failure(&err, ctx);
                    return Err(err);
                }
            }
        }
        Ok(response)
    }

    /// Offer `error` to each enabled error interceptor that accepts it.
    ///
    /// The first recovery wins. A failing interceptor is skipped and the
    /// chain continues with the error it was given.
    pub async fn execute_error_chain(&self, mut error: NetError, ctx: &mut CallContext) -> ErrorOutcome {
        for interceptor in snapshot(&self.error) {
            if !interceptor.handler.can_handle(&error) {
                continue;
            }
            match interceptor.handler.handle(error.clone(), ctx).await {
                Ok(ErrorDisposition::Recovered(response)) => {
                    debug!(interceptor = %interceptor.name, status = response.status, "Error recovered");
                    return ErrorOutcome::Recovered(response);
                }
                Ok(ErrorDisposition::Continue(next)) => error = next,
                Err(failure) => {
                    warn!(
                        interceptor = %interceptor.name,
                        error = %failure,
                        "Error interceptor failed, continuing with previous error"
                    );
                    interceptor.fire_failure(&failure, ctx);
                }
            }
        }
        ErrorOutcome::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use netguard_domain::ErrorKind;

    use super::*;

    fn ctx() -> CallContext {
        CallContext::new(&NetRequest::get("https://api.example.com/"), Instant::now())
    }

    fn tagger(name: &'static str, priority: i32) -> RequestInterceptor {
        RequestInterceptor::request_fn(name, priority, move |req, ctx| {
            ctx.tag(name);
            Ok(req)
        })
    }

    /// Validates `InterceptorChain` ordering for the priority/tie scenario.
    ///
    /// Assertions:
    /// - Confirms lower priority runs first.
    /// - Confirms equal priorities keep insertion order.
    #[tokio::test]
    async fn runs_in_stable_priority_order() {
        let chain = InterceptorChain::new();
        chain.add_request_interceptor(tagger("c", 10));
        chain.add_request_interceptor(tagger("a", 0));
        chain.add_request_interceptor(tagger("b1", 5));
        chain.add_request_interceptor(tagger("b2", 5));

        let mut ctx = ctx();
        chain.execute_request_chain(NetRequest::get("http://h/"), &mut ctx).await.unwrap();
        assert_eq!(ctx.tags, vec!["a", "b1", "b2", "c"]);
        assert_eq!(chain.names(Phase::Request), vec!["a", "b1", "b2", "c"]);
    }

    #[tokio::test]
    async fn request_failure_stops_chain_and_fires_callback() {
        let chain = InterceptorChain::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        chain.add_request_interceptor(
            RequestInterceptor::request_fn("boom", 0, |_, _| Err(NetError::interceptor("boom", "nope")))
                .on_failure(move |_, _| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
        );
        chain.add_request_interceptor(tagger("after", 1));

        let mut ctx = ctx();
        let err = chain.execute_request_chain(NetRequest::get("http://h/"), &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Interceptor);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(ctx.tags.is_empty());
    }

    #[tokio::test]
    async fn request_chain_threads_mutations() {
        let chain = InterceptorChain::new();
        chain.add_request_interceptor(RequestInterceptor::request_fn("h1", 0, |req, _| {
            Ok(req.with_header("x-one", "1"))
        }));
        chain.add_request_interceptor(RequestInterceptor::request_fn("h2", 1, |req, _| {
            let one = req.header("x-one").unwrap_or("missing").to_string();
            Ok(req.with_header("x-two", one))
        }));
        let out = chain.execute_request_chain(NetRequest::get("http://h/"), &mut ctx()).await.unwrap();
        assert_eq!(out.header("x-two"), Some("1"));
    }

    #[tokio::test]
    async fn response_chain_runs_in_order() {
        let chain = InterceptorChain::new();
        chain.add_response_interceptor(ResponseInterceptor::response_fn("second", 2, |resp, _| {
            let body = format!("{}b", resp.text());
            Ok(resp.with_body(body))
        }));
        chain.add_response_interceptor(ResponseInterceptor::response_fn("first", 1, |resp, _| {
            let body = format!("{}a", resp.text());
            Ok(resp.with_body(body))
        }));
        let out = chain.execute_response_chain(NetResponse::new(200), &mut ctx()).await.unwrap();
        assert_eq!(out.body, b"ab");
    }

    /// Validates `execute_error_chain` behavior for the isolation and
    /// recovery scenario.
    ///
    /// Assertions:
    /// - Ensures a failing handler is skipped and the previous error kept.
    /// - Confirms a modified error reaches later handlers.
    /// - Confirms the first recovery short-circuits the chain.
    #[tokio::test]
    async fn error_chain_isolates_failures_and_recovers() {
        let chain = InterceptorChain::new();
        let late = Arc::new(AtomicUsize::new(0));
        let l = Arc::clone(&late);
        chain.add_error_interceptor(ErrorInterceptor::error_fn("broken", 0, |_, _| {
            Err(NetError::interceptor("broken", "bug"))
        }));
        chain.add_error_interceptor(ErrorInterceptor::error_fn("annotate", 1, |err, _| {
            Ok(ErrorDisposition::Continue(err.with_message("annotated")))
        }));
        chain.add_error_interceptor(ErrorInterceptor::error_fn("recover", 2, |err, _| {
            assert_eq!(err.message, "annotated");
            assert_eq!(err.status, 503);
            Ok(ErrorDisposition::Recovered(NetResponse::new(200)))
        }));
        chain.add_error_interceptor(ErrorInterceptor::error_fn("never", 3, move |err, _| {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(ErrorDisposition::Continue(err))
        }));

        let outcome = chain.execute_error_chain(NetError::from_status(503, "down"), &mut ctx()).await;
        assert_eq!(outcome, ErrorOutcome::Recovered(NetResponse::new(200)));
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    struct OnlyServer;

    #[async_trait]
    impl ErrorHandler for OnlyServer {
        fn can_handle(&self, error: &NetError) -> bool {
            error.is_server_error()
        }

        async fn handle(&self, _error: NetError, _ctx: &mut CallContext) -> Result<ErrorDisposition, NetError> {
            Ok(ErrorDisposition::Recovered(NetResponse::new(200)))
        }
    }

    #[tokio::test]
    async fn can_handle_filters_errors() {
        let chain = InterceptorChain::new();
        chain.add_error_interceptor(ErrorInterceptor::error("server-only", 0, OnlyServer));

        let outcome = chain.execute_error_chain(NetError::from_status(404, "missing"), &mut ctx()).await;
        assert!(matches!(outcome, ErrorOutcome::Failed(ref e) if e.status == 404));
        let outcome = chain.execute_error_chain(NetError::from_status(500, "oops"), &mut ctx()).await;
        assert!(matches!(outcome, ErrorOutcome::Recovered(_)));
    }

    #[tokio::test]
    async fn remove_toggle_and_replace() {
        let chain = InterceptorChain::new();
        let handle = chain.add_request_interceptor(tagger("a", 0));
        chain.add_request_interceptor(tagger("b", 1));
        chain.add_request_interceptor(tagger("b", -1));
        assert_eq!(chain.names(Phase::Request), vec!["b", "a"]);

        assert!(chain.set_enabled("b", false));
        let mut c = ctx();
        chain.execute_request_chain(NetRequest::get("http://h/"), &mut c).await.unwrap();
        assert_eq!(c.tags, vec!["a"]);

        assert!(chain.remove(handle));
        assert!(!chain.remove(handle));
        assert!(chain.remove_by_name("b"));
        assert!(!chain.set_enabled("b", true));
        assert!(chain.names(Phase::Request).is_empty());
    }
}
