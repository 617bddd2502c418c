//! Per-call and per-connection hook records.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Error code reported when a call outlives `ClientConfig::call_timeout`.
pub const CALL_TIMEOUT_CODE: i32 = 408;

/// Error code reported when a response body is not valid JSON.
pub const INVALID_BODY_CODE: i32 = -1;

/// Error code reported when a response `code` header is not an integer.
pub const UNKNOWN_ERROR_CODE: i32 = -2;

type Hook = Arc<dyn Fn() + Send + Sync>;
type SuccessHook = Arc<dyn Fn(Value) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(i32, String) + Send + Sync>;
type ReasonHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Response hooks for one call or one persistent listener.
///
/// Every hook is optional. For each delivered response exactly one of
/// `on_success` / `on_error` runs, followed by `on_end`. `on_start` runs
/// once, right before the request is written.
#[derive(Clone, Default)]
pub struct Callback {
    on_start: Option<Hook>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
    on_end: Option<Hook>,
}

impl Callback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    /// Receives the parsed response body. An empty body arrives as `{}`.
    pub fn on_success(mut self, hook: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Receives the `code` and decoded `message` of an error response.
    pub fn on_error(mut self, hook: impl Fn(i32, String) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn on_end(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(hook));
        self
    }

    /// Returns true if no hook is set.
    pub fn is_empty(&self) -> bool {
        self.on_start.is_none()
            && self.on_success.is_none()
            && self.on_error.is_none()
            && self.on_end.is_none()
    }

    pub(crate) fn start(&self) {
        if let Some(hook) = &self.on_start {
            hook();
        }
    }

    fn succeed(&self, body: Value) {
        if let Some(hook) = &self.on_success {
            hook(body);
        }
    }

    fn fail(&self, code: i32, message: String) {
        if let Some(hook) = &self.on_error {
            hook(code, message);
        }
    }

    fn end(&self) {
        if let Some(hook) = &self.on_end {
            hook();
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("on_start", &self.on_start.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_end", &self.on_end.is_some())
            .finish()
    }
}

/// Result of one response, ready to hand to a [`Callback`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Success(Value),
    Failure { code: i32, message: String },
}

/// A matched callback and the outcome it should see.
///
/// Built under the multiplexer lock, run after it is released.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) callback: Callback,
    pub(crate) outcome: Outcome,
}

impl Delivery {
    pub(crate) fn run(self) {
        match self.outcome {
            Outcome::Success(body) => self.callback.succeed(body),
            Outcome::Failure { code, message } => self.callback.fail(code, message),
        }
        self.callback.end();
    }
}

/// Connection lifecycle hooks.
#[derive(Clone, Default)]
pub struct Lifecycle {
    on_open: Option<Hook>,
    on_close: Option<Hook>,
    on_error: Option<ReasonHook>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    pub fn on_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub(crate) fn opened(&self) {
        if let Some(hook) = &self.on_open {
            hook();
        }
    }

    pub(crate) fn closed(&self) {
        if let Some(hook) = &self.on_close {
            hook();
        }
    }

    pub(crate) fn errored(&self, reason: &str) {
        if let Some(hook) = &self.on_error {
            hook(reason);
        }
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
