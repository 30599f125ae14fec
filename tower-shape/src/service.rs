use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use shape_limit::ShapeError;
use shape_limit::TrafficShaper;
use tower::BoxError;
use tower::Service;
use tracing::warn;

use crate::layer::IdFn;

#[derive(Clone, Debug)]
struct ShapeServiceMetrics {
    shaped: Counter<u64>,
    failures: Counter<u64>,
    delay: Histogram<f64>,
}

impl ShapeServiceMetrics {
    fn new() -> Self {
        let meter = global::meter("shape_service");
        Self {
            shaped: meter.u64_counter("shaped_requests").build(),
            failures: meter.u64_counter("shaping_failures").build(),
            delay: meter
                .f64_histogram("shaping_delay")
                .with_unit("ms")
                .build(),
        }
    }
}

/// Waits on a [`TrafficShaper`] before each call and acks once the inner
/// service has answered, successfully or not.
///
/// Shaping errors reach the caller as a boxed [`ShapeError`].
pub struct ShapeService<S, Req> {
    inner: S,
    shaper: Arc<TrafficShaper>,
    id: IdFn<Req>,
    instruments: ShapeServiceMetrics,
}

impl<S: fmt::Debug, Req> fmt::Debug for ShapeService<S, Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeService")
            .field("inner", &self.inner)
            .field("shaper", &self.shaper)
            .finish()
    }
}

impl<S: Clone, Req> Clone for ShapeService<S, Req> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shaper: Arc::clone(&self.shaper),
            id: Arc::clone(&self.id),
            instruments: self.instruments.clone(),
        }
    }
}

impl<S, Req: 'static> ShapeService<S, Req> {
    pub fn new(inner: S, shaper: Arc<TrafficShaper>) -> Self {
        Self {
            inner,
            shaper,
            id: Arc::new(|_: &Req| String::new()),
            instruments: ShapeServiceMetrics::new(),
        }
    }

    /// See [`ShapeLayer::with_id`](crate::ShapeLayer::with_id).
    pub fn with_id<F>(self, id: F) -> Self
    where
        F: Fn(&Req) -> String + Send + Sync + 'static,
    {
        self.with_id_fn(Arc::new(id))
    }

    pub(crate) fn with_id_fn(mut self, id: IdFn<Req>) -> Self {
        self.id = id;
        self
    }
}

fn reason(err: &ShapeError) -> &'static str {
    match err {
        ShapeError::Timeout => "timeout",
        ShapeError::InvalidArgument(_) => "invalid_argument",
        ShapeError::ShapingUnavailable(_) | ShapeError::StoreUnavailable(_) => "unavailable",
        ShapeError::InvalidConfig(_) | ShapeError::OutOfRange(_) => "internal",
    }
}

impl<S, Req> Service<Req> for ShapeService<S, Req>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // The clone takes our place; the instance that was polled ready serves
        // this request
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let id = (self.id)(&req);
        let shaper = Arc::clone(&self.shaper);
        let instruments = self.instruments.clone();

        Box::pin(async move {
            let admission = match shaper.wait(&id).await {
                Ok(admission) => admission,
                Err(err) => {
                    instruments
                        .failures
                        .add(1, &[KeyValue::new("reason", reason(&err))]);
                    return Err(Box::new(err) as BoxError);
                }
            };
            instruments.shaped.add(1, &[]);
            instruments
                .delay
                .record(admission.delay().as_secs_f64() * 1_000.0, &[]);

            let result = inner.call(req).await.map_err(Into::into);

            if let Err(err) = admission.ack().await {
                warn!(id, %err, "failed to ack shaped request");
            }
            result
        })
    }
}
