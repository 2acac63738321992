//! Tower middleware applying a [`Limiter`] to every request.
//!
//! The request is classified by a [`SourceExtractor`] into a key and a weight,
//! the weight is charged against the key, and the request is forwarded only
//! when admitted. A limiter *error* fails open: the request proceeds and a
//! warning is logged, so a store outage never blocks traffic.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tower_layer::Layer;
use tower_service::Service;

use crate::limiter::{Limit, Limiter};

/// Boxed extractor error carried by [`LayerError::Extract`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Produces the grouping key and weight of a request.
///
/// Implemented for any `Fn(&Req) -> Result<(String, u64), E>`.
pub trait SourceExtractor<Req>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn extract(&self, req: &Req) -> Result<(String, u64), Self::Error>;
}

impl<Req, F, E> SourceExtractor<Req> for F
where
    F: Fn(&Req) -> Result<(String, u64), E> + Send + Sync,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn extract(&self, req: &Req) -> Result<(String, u64), E> {
        self(req)
    }
}

/// Error returned by [`RateLimitService`].
#[derive(Debug, thiserror::Error)]
pub enum LayerError<E> {
    /// The wrapped service failed.
    #[error("inner service error: {0}")]
    Inner(#[source] E),
    /// The request was denied; `retry_after` is when it could be admitted.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// The request could not be classified.
    #[error("cannot extract request source: {0}")]
    Extract(#[source] BoxError),
}

impl<E> LayerError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Layer producing [`RateLimitService`]s that share one limiter and extractor.
pub struct RateLimitLayer<X> {
    limiter: Arc<Limiter>,
    limit: Limit,
    extractor: Arc<X>,
}

impl<X> RateLimitLayer<X> {
    pub fn new(limiter: Arc<Limiter>, limit: Limit, extractor: X) -> Self {
        Self { limiter, limit, extractor: Arc::new(extractor) }
    }
}

impl<X> Clone for RateLimitLayer<X> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), limit: self.limit, extractor: self.extractor.clone() }
    }
}

impl<S, X> Layer<S> for RateLimitLayer<X> {
    type Service = RateLimitService<S, X>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            limit: self.limit,
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service that charges each request against the limiter.
pub struct RateLimitService<S, X> {
    inner: S,
    limiter: Arc<Limiter>,
    limit: Limit,
    extractor: Arc<X>,
}

impl<S: Clone, X> Clone for RateLimitService<S, X> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            limit: self.limit,
            extractor: self.extractor.clone(),
        }
    }
}

impl<S, X, Req> Service<Req> for RateLimitService<S, X>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    X: SourceExtractor<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = LayerError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LayerError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let source = self.extractor.extract(&req);
        let limiter = self.limiter.clone();
        let limit = self.limit;
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (key, weight) = source.map_err(|err| LayerError::Extract(Box::new(err)))?;
            if weight > 0 {
                match limiter.allow_n(&key, limit, weight).await {
                    Ok(result) if result.is_denied() => {
                        return Err(LayerError::RateLimited { retry_after: result.retry_after() });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(key = key.as_str(), error = %err, "rate limiter unavailable, letting request through");
                    }
                }
            }
            inner.call(req).await.map_err(LayerError::Inner)
        })
    }
}
