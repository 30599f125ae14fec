//! # Tower Shape
//!
//! `tower-shape` puts a [`shape_limit::TrafficShaper`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! Each request first waits on the shaper: it is either paced, or queued until
//! one of the cluster-wide concurrency slots for its id is free. The inner
//! service then runs, and the slot is acked as soon as it answers, whether
//! it succeeded or not.
//!
//! Shaping failures surface as a boxed [`shape_limit::ShapeError`]:
//!
//! ```rust,ignore
//! if let Some(ShapeError::Timeout) = err.downcast_ref::<ShapeError>() {
//!     // No slot freed up in time
//! }
//! ```
//!
//! ## Metrics
//!
//! Through the global `opentelemetry` meter `shape_service`:
//! `shaped_requests`, `shaping_failures` (by `reason`) and the
//! `shaping_delay` histogram in milliseconds.

mod layer;
mod service;
mod utils;


pub use layer::ShapeLayer;
pub use service::ShapeService;
pub use utils::make_shaped_svc;
