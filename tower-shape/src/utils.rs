use std::sync::Arc;

use shape_limit::TrafficShaper;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::util::BoxCloneSyncService;

use crate::ShapeLayer;

/// Shape `svc` through `shaper`, keyed by `id`, behind a type-erased service.
pub fn make_shaped_svc<V, Req, Resp, F>(
    shaper: Arc<TrafficShaper>,
    id: F,
    svc: V,
) -> BoxCloneSyncService<Req, Resp, BoxError>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(&Req) -> String + Send + Sync + 'static,
    V: Service<Req, Response = Resp, Error = BoxError> + Clone + Send + Sync + 'static,
    <V as Service<Req>>::Future: Send,
{
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(ShapeLayer::new(shaper).with_id(id))
            .service(svc),
    )
}
