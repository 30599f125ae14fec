use std::sync::Arc;

use shape_limit::TrafficShaper;
use tower::Layer;

use crate::service::ShapeService;

/// Picks the shaping id for a request.
pub(crate) type IdFn<Req> = Arc<dyn Fn(&Req) -> String + Send + Sync>;

/// Shapes requests through a [`TrafficShaper`] before they reach the inner
/// service.
pub struct ShapeLayer<Req> {
    shaper: Arc<TrafficShaper>,
    id: IdFn<Req>,
}

impl<Req> Clone for ShapeLayer<Req> {
    fn clone(&self) -> Self {
        Self {
            shaper: Arc::clone(&self.shaper),
            id: Arc::clone(&self.id),
        }
    }
}

impl<Req: 'static> ShapeLayer<Req> {
    /// Create a ShapeLayer. Every request is shaped under the empty id, i.e.
    /// on the shaper's namespace alone.
    pub fn new(shaper: Arc<TrafficShaper>) -> Self {
        ShapeLayer {
            shaper,
            id: Arc::new(|_: &Req| String::new()),
        }
    }

    /// Shape each request under the id `id` derives from it.
    ///
    /// Requests with different ids are paced or capped independently.
    pub fn with_id<F>(mut self, id: F) -> Self
    where
        F: Fn(&Req) -> String + Send + Sync + 'static,
    {
        self.id = Arc::new(id);
        self
    }
}

impl<Req: 'static, S> Layer<S> for ShapeLayer<Req> {
    type Service = ShapeService<S, Req>;

    fn layer(&self, service: S) -> Self::Service {
        ShapeService::new(service, self.shaper.clone()).with_id_fn(self.id.clone())
    }
}
