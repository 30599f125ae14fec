use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::Clock;
use crate::ShapeError;
use crate::admission::ConcurrencyAdmissionController;
use crate::admission::Slot;
use crate::config::Mode;
use crate::config::ShaperConfig;
use crate::config::ShaperOptions;
use crate::history::request_id;
use crate::predictor::DelayPredictor;
use crate::predictor::to_sleep;

/// Longest id accepted by [`TrafficShaper::wait`], in bytes.
pub const MAX_ID_LEN: usize = 256;

#[derive(Debug)]
enum Strategy {
    Pacing(DelayPredictor),
    ConcurrencyCap(ConcurrencyAdmissionController),
}

/// The outcome of a successful [`TrafficShaper::wait`].
///
/// In concurrency-cap mode the admission holds a slot until it is acked or
/// dropped.
#[derive(Debug)]
#[must_use = "a concurrency slot is released as soon as the admission is dropped"]
pub struct Admission {
    delay: Duration,
    slot: Option<Slot>,
}

impl Admission {
    /// How long the call was held back: the pacing sleep, or the time spent
    /// queued for a slot.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn slot(&self) -> Option<&Slot> {
        self.slot.as_ref()
    }

    /// Release the slot, if there is one.
    ///
    /// Returns `true` only when this call vacated the slot. Pacing admissions
    /// hold nothing and always return `false`.
    pub async fn ack(&self) -> Result<bool, ShapeError> {
        match &self.slot {
            Some(slot) => slot.ack().await,
            None => Ok(false),
        }
    }
}

/// Shapes calls made by many processes against shared keys.
///
/// A shaper either paces calls, sleeping each one for a delay derived from
/// recent traffic on its key, or caps how many calls per key are in flight at
/// once.
#[derive(Debug)]
pub struct TrafficShaper {
    namespace: String,
    timeout: Duration,
    clock: Clock,
    strategy: Strategy,
}

impl TrafficShaper {
    /// Validate `options` and build a shaper.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if any option is out of range.
    pub fn new(options: ShaperOptions) -> Result<Self, ShapeError> {
        Self::with_clock(options, Clock::new())
    }

    pub fn with_clock(options: ShaperOptions, clock: Clock) -> Result<Self, ShapeError> {
        Ok(Self::from_config(options.validate()?, clock))
    }

    pub fn from_config(config: ShaperConfig, clock: Clock) -> Self {
        let store = config.store().clone();
        let strategy = match config.mode() {
            Mode::Pacing(strategy) => Strategy::Pacing(DelayPredictor::new(
                strategy,
                store.command,
                config.history(),
                config.timeout(),
            )),
            Mode::ConcurrencyCap {
                capacity,
                retention,
            } => Strategy::ConcurrencyCap(ConcurrencyAdmissionController::with_clock(
                store.command,
                store.publisher,
                store.subscriber,
                capacity.get() as usize,
                retention,
                config.timeout(),
                clock.clone(),
            )),
        };

        Self {
            namespace: config.namespace().to_string(),
            timeout: config.timeout(),
            clock,
            strategy,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The controller behind a concurrency-cap shaper.
    pub fn controller(&self) -> Option<&ConcurrencyAdmissionController> {
        match &self.strategy {
            Strategy::ConcurrencyCap(controller) => Some(controller),
            Strategy::Pacing(_) => None,
        }
    }

    /// Wait until a call on `id` may proceed.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `id` is too long or contains control characters.
    /// - `Timeout` if the store is too slow, no slot frees up in time, or the
    ///   pacing delay alone would exceed the timeout.
    /// - `ShapingUnavailable` if the store fails.
    pub async fn wait(&self, id: &str) -> Result<Admission, ShapeError> {
        let key = self.key(id)?;
        match &self.strategy {
            Strategy::Pacing(predictor) => {
                let now = self.clock.now_micros();
                let delay = predictor.delay(&key, &request_id(now), now).await?;
                let sleep = to_sleep(delay);
                if sleep > self.timeout {
                    debug!(key, delay_ms = sleep.as_millis() as u64, "pacing delay exceeds timeout");
                    return Err(ShapeError::Timeout);
                }
                if !sleep.is_zero() {
                    tokio::time::sleep(sleep).await;
                }
                Ok(Admission {
                    delay: sleep,
                    slot: None,
                })
            }
            Strategy::ConcurrencyCap(controller) => {
                let started = Instant::now();
                let slot = controller.wait(&key).await?;
                let delay = started.elapsed();
                debug!(
                    key,
                    queued = slot.was_queued(),
                    delay_ms = delay.as_millis() as u64,
                    "admitted"
                );
                Ok(Admission {
                    delay,
                    slot: Some(slot),
                })
            }
        }
    }

    /// Release the slot held by `admission`. See [`Admission::ack`].
    pub async fn ack(&self, admission: &Admission) -> Result<bool, ShapeError> {
        admission.ack().await
    }

    /// Record a call on `id` at `timestamp_micros` and return its pacing
    /// delay in microseconds, without sleeping.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on a concurrency-cap shaper or a bad `id`, otherwise
    /// as for [`wait`](TrafficShaper::wait).
    pub async fn get_delay(&self, timestamp_micros: i64, id: &str) -> Result<i64, ShapeError> {
        let key = self.key(id)?;
        match &self.strategy {
            Strategy::Pacing(predictor) => {
                predictor
                    .delay(&key, &request_id(timestamp_micros), timestamp_micros)
                    .await
            }
            Strategy::ConcurrencyCap(_) => Err(ShapeError::InvalidArgument(
                "get_delay needs a pacing shaper".to_string(),
            )),
        }
    }

    fn key(&self, id: &str) -> Result<String, ShapeError> {
        validate_id(id)?;
        Ok(format!("{}{id}", self.namespace))
    }
}

fn validate_id(id: &str) -> Result<(), ShapeError> {
    if id.len() > MAX_ID_LEN {
        return Err(ShapeError::InvalidArgument(format!(
            "id is {} bytes long, at most {MAX_ID_LEN} allowed",
            id.len()
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(ShapeError::InvalidArgument(
            "id must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::config::Pacing;
    use crate::config::StoreOptions;
    use crate::store::MemoryStore;

    fn shaper(options: impl FnOnce(ShaperOptions) -> ShaperOptions) -> (TrafficShaper, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let options = options(ShaperOptions::new(StoreOptions::shared(store.clone())));
        (TrafficShaper::new(options).unwrap(), store)
    }

    #[test]
    fn test_id_validation() {
        assert!(validate_id("").is_ok());
        assert!(validate_id("user-42/ünïcode").is_ok());
        assert!(validate_id(&"x".repeat(MAX_ID_LEN)).is_ok());
        assert!(matches!(
            validate_id(&"x".repeat(MAX_ID_LEN + 1)),
            Err(ShapeError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_id("line\nbreak"),
            Err(ShapeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_config_builds_nothing() {
        let store = Arc::new(MemoryStore::new());
        let options = ShaperOptions::new(StoreOptions::shared(store)).with_capacity(1);
        assert!(matches!(
            TrafficShaper::new(options),
            Err(ShapeError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let (shaper, store) = shaper(|options| options.with_namespace("api:"));
        let _admission = shaper.wait("users").await.unwrap();
        assert!(store.contains("api:users"));
        assert_eq!(shaper.namespace(), "api:");
    }

    #[tokio::test]
    async fn test_bad_id_touches_nothing() {
        let (shaper, store) = shaper(|options| options);
        let err = shaper.wait("a\tb").await.unwrap_err();
        assert!(matches!(err, ShapeError::InvalidArgument(_)));
        assert!(!store.contains("defaultShapera\tb"));
    }

    #[tokio::test]
    async fn test_get_delay_needs_pacing() {
        let (shaper, _) = shaper(|options| options.with_capacity(2));
        assert!(shaper.controller().is_some());
        assert!(matches!(
            shaper.get_delay(0, "k").await,
            Err(ShapeError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_get_delay_does_not_sleep() {
        const MS: i64 = 1_000;
        let (shaper, _) = shaper(|options| options.with_pacing(Pacing::MedianGap));
        assert!(shaper.controller().is_none());

        assert_eq!(shaper.get_delay(0, "k").await.unwrap(), 0);
        assert_eq!(shaper.get_delay(100 * MS, "k").await.unwrap(), 0);
        assert_eq!(shaper.get_delay(130 * MS, "k").await.unwrap(), 70 * MS);
    }

    #[tokio::test]
    async fn test_pacing_admission_acks_nothing() {
        let (shaper, _) = shaper(|options| options);
        let admission = shaper.wait("k").await.unwrap();
        assert!(admission.slot().is_none());
        assert!(!shaper.ack(&admission).await.unwrap());
    }
}
