//! # shape-limit
//!
//! `shape-limit` shapes traffic across every process that shares a
//! coordination store, such as Redis.
//!
//! ## Modes
//!
//! * **Pacing**: each call records itself in its key's history and sleeps for
//!   a delay derived from the recent gaps between calls. See
//!   [`PacingStrategy`].
//! * **Concurrency cap**: at most `capacity` calls per key are in flight at
//!   once, cluster-wide. Calls over the cap queue locally and are released in
//!   order as other calls [`ack`](Admission::ack).
//!
//! ## Key Concepts
//!
//! * **No client-side locks**: every check-and-update is a single atomic
//!   batch or script in the store.
//! * **Bounded failure**: every round trip is bounded by a timeout, and a call
//!   that fails or is cancelled gives its slot back.
//! * **Wraparound-safe counting**: release notifications are counted on a
//!   [`SequenceCounter`] that never overflows.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use shape_limit::MemoryStore;
//! use shape_limit::ShaperOptions;
//! use shape_limit::StoreOptions;
//! use shape_limit::TrafficShaper;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), shape_limit::ShapeError> {
//! let store = Arc::new(MemoryStore::new());
//! let shaper = TrafficShaper::new(
//!     ShaperOptions::new(StoreOptions::shared(store)).with_capacity(10),
//! )?;
//!
//! let admission = shaper.wait("user-42").await?;
//! // Call the guarded resource here
//! admission.ack().await?;
//! # Ok(())
//! # }
//! ```

mod admission;
mod clock;
mod config;
mod counter;
mod error;
mod history;
mod predictor;
mod shaper;
pub mod store;


pub use admission::ConcurrencyAdmissionController;
pub use admission::Slot;
pub use admission::SubscriptionState;
pub use clock::Clock;
pub use config::Mode;
pub use config::Pacing;
pub use config::ShaperConfig;
pub use config::ShaperOptions;
pub use config::StoreHandles;
pub use config::StoreOptions;
pub use counter::MAX_SAFE_VALUE;
pub use counter::SequenceCounter;
pub use error::ShapeError;
pub use history::HistoryEntry;
pub use history::HistoryStore;
pub use history::request_id;
pub use predictor::DelayPredictor;
pub use predictor::GAIN_SCRIPT;
pub use predictor::PacingStrategy;
pub use predictor::mean_gap_delay;
pub use predictor::median_gap_delay;
pub use predictor::to_sleep;
pub use shaper::Admission;
pub use shaper::MAX_ID_LEN;
pub use shaper::TrafficShaper;
pub use store::MemoryStore;
