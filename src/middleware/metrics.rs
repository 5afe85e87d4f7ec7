//! Per-endpoint request counting and timing.
//!
//! Endpoints are keyed by route pattern (`GET /api/v1/config`) rather than the
//! raw path, so every path parameter value lands in the same bucket.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct EndpointMetrics;

impl<S, B> Transform<S, ServiceRequest> for EndpointMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = EndpointMetricsService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(EndpointMetricsService { service }))
    }
}

pub struct EndpointMetricsService<S> {
    service: S,
}

/// "METHOD pattern", falling back to the literal path for unmatched routes.
fn endpoint_key(req: &ServiceRequest) -> String {
    let route = req
        .request()
        .match_pattern()
        .unwrap_or_else(|| req.path().to_string());
    format!("{} {}", req.method(), route)
}

impl<S, B> Service<ServiceRequest> for EndpointMetricsService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = endpoint_key(&req);
        let app_state = req.app_data::<web::Data<AppState>>().cloned();

        if let Some(state) = &app_state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
                Err(_) => true,
            };

            if let Some(state) = app_state {
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }

            result
        })
    }
}
