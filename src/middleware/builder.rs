use crate::middleware::{RejectHandler, RequestThrottler, RollbackCondition};
use crate::policy::Quota;
use crate::registry::{QuotaStatus, ThrottleRegistry};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::HeaderName;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// JSON body of the default rejection response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionBody {
    pub success: bool,
    pub error: String,
}

impl Default for RejectionBody {
    fn default() -> Self {
        Self {
            success: false,
            error: "Too many requests, please try again later.".to_owned(),
        }
    }
}

pub struct ThrottlerBuilder<F> {
    registry: ThrottleRegistry,
    quota: Quota,
    key_fn: F,
    on_reject: Rc<RejectHandler>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<F> ThrottlerBuilder<F>
where
    F: Fn(&ServiceRequest) -> String + 'static,
{
    pub(super) fn new(registry: ThrottleRegistry, quota: Quota, key_fn: F) -> Self {
        Self {
            registry,
            quota,
            key_fn,
            on_reject: Rc::new(|_| {
                HttpResponse::TooManyRequests().json(RejectionBody::default())
            }),
            rollback_condition: None,
        }
    }

    /// Replace the rejection response.
    ///
    /// The handler controls status and body only; the quota headers and
    /// `retry-after` are attached on top of whatever it returns.
    ///
    /// Defaults to status 429 with a JSON [RejectionBody].
    pub fn on_reject<R>(mut self, handler: R) -> Self
    where
        R: Fn(&QuotaStatus) -> HttpResponse + 'static,
    {
        self.on_reject = Rc::new(handler);
        self
    }

    /// After an admitted request completes, un-count it when the response
    /// status matches the condition.
    ///
    /// By default admitted requests always stay counted.
    pub fn rollback_condition<C>(mut self, condition: C) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = Some(Rc::new(condition));
        self
    }

    /// Configures [ThrottlerBuilder::rollback_condition] to un-count requests
    /// that end in a server error (5xx), so a failing upstream does not eat
    /// into a client's quota.
    pub fn rollback_server_errors(self) -> Self {
        self.rollback_condition(|status| status.is_server_error())
    }

    pub fn build(self) -> RequestThrottler<F> {
        RequestThrottler {
            registry: self.registry,
            quota: self.quota,
            key_fn: Rc::new(self.key_fn),
            on_reject: self.on_reject,
            rollback_condition: self.rollback_condition,
        }
    }
}
