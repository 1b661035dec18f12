pub mod builder;
#[cfg(test)]
mod tests;

use crate::policy::Quota;
use crate::registry::{QuotaStatus, ThrottleRegistry};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use builder::{ThrottlerBuilder, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
use futures::future::{ok, LocalBoxFuture, Ready};
use std::rc::Rc;

type RejectHandler = dyn Fn(&QuotaStatus) -> HttpResponse;
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// Request throttling middleware.
///
/// Counts every request against the quota for its extracted key. Admitted
/// requests proceed to the wrapped service; once a key exceeds its quota the
/// pipeline short-circuits with the rejection response until the window
/// resets. Both outcomes carry `x-ratelimit-limit`, `x-ratelimit-remaining`
/// and `x-ratelimit-reset` (epoch seconds) headers; rejections additionally
/// carry `retry-after`.
pub struct RequestThrottler<F> {
    registry: ThrottleRegistry,
    quota: Quota,
    key_fn: Rc<F>,
    on_reject: Rc<RejectHandler>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<F> Clone for RequestThrottler<F> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            quota: self.quota,
            key_fn: Rc::clone(&self.key_fn),
            on_reject: Rc::clone(&self.on_reject),
            rollback_condition: self.rollback_condition.clone(),
        }
    }
}

impl<F> RequestThrottler<F>
where
    F: Fn(&ServiceRequest) -> String + 'static,
{
    /// # Arguments
    ///
    /// * `registry`: The accounting store; build it outside the `App` factory
    ///   so all workers share one set of counters.
    /// * `quota`: The per-key request allowance for one window.
    /// * `key_fn`: Maps an incoming request to its throttle key, typically
    ///   built with [ClientKeyBuilder](crate::key::ClientKeyBuilder).
    pub fn builder(registry: ThrottleRegistry, quota: Quota, key_fn: F) -> ThrottlerBuilder<F> {
        ThrottlerBuilder::new(registry, quota, key_fn)
    }
}

impl<S, B, F> Transform<S, ServiceRequest> for RequestThrottler<F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    F: Fn(&ServiceRequest) -> String + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = ThrottlerMiddleware<S, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ThrottlerMiddleware {
            service: Rc::new(service),
            registry: self.registry.clone(),
            quota: self.quota,
            key_fn: Rc::clone(&self.key_fn),
            on_reject: Rc::clone(&self.on_reject),
            rollback_condition: self.rollback_condition.clone(),
        })
    }
}

pub struct ThrottlerMiddleware<S, F> {
    service: Rc<S>,
    registry: ThrottleRegistry,
    quota: Quota,
    key_fn: Rc<F>,
    on_reject: Rc<RejectHandler>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<S, B, F> Service<ServiceRequest> for ThrottlerMiddleware<S, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    F: Fn(&ServiceRequest) -> String + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let registry = self.registry.clone();
        let quota = self.quota;
        let key = (self.key_fn)(&req);
        let on_reject = Rc::clone(&self.on_reject);
        let rollback_condition = self.rollback_condition.clone();

        Box::pin(async move {
            let (decision, status) = registry.evaluate(&key, quota);

            if decision.is_rejected() {
                log::debug!(
                    "request throttled for key {key:?}, retry in {}s",
                    status.seconds_until_reset()
                );
                let mut response = (on_reject)(&status);
                let headers = response.headers_mut();
                annotate(headers, &status, false);
                headers.insert(RETRY_AFTER, HeaderValue::from(status.seconds_until_reset()));
                return Ok(req.into_response(response).map_into_right_body());
            }

            let mut service_response = service.call(req).await?;

            let mut rolled_back = false;
            if let Some(condition) = &rollback_condition {
                if condition(service_response.status()) {
                    registry.rollback(&key);
                    rolled_back = true;
                }
            }

            annotate(service_response.headers_mut(), &status, rolled_back);
            Ok(service_response.map_into_left_body())
        })
    }
}

fn annotate(headers: &mut HeaderMap, status: &QuotaStatus, rolled_back: bool) {
    let remaining = if rolled_back {
        status.remaining.saturating_add(1).min(status.limit)
    } else {
        status.remaining
    };
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit));
    headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
    headers.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(status.reset_epoch_seconds()),
    );
}
