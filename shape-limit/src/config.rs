use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use crate::ShapeError;
use crate::predictor::PacingStrategy;
use crate::store::CoordinationStore;

pub const DEFAULT_NAMESPACE: &str = "defaultShaper";
pub const DEFAULT_MAX_REGULATED_DELAY_MS: u64 = 100;
pub const DEFAULT_GAIN: f64 = 0.00001;
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_HISTORY_MS: u64 = 10_000;

/// Which pacing heuristic to use when no capacity is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    #[default]
    MedianGap,
    MeanGap,
    /// Evaluated in the store, driven by `gain` and `max_regulated_delay_ms`.
    Gain,
}

/// How the shaper reaches its coordination store.
#[derive(Debug, Clone)]
pub enum StoreOptions {
    /// Connect to a Redis server. Needs the `redis` feature.
    Connection { host: String, port: u16 },
    /// Use handles built by the caller.
    ///
    /// `publisher` and `subscriber` default to `command`. Stores that cannot
    /// run commands on a subscribed connection need a separate `subscriber`.
    Handles {
        command: Arc<dyn CoordinationStore>,
        publisher: Option<Arc<dyn CoordinationStore>>,
        subscriber: Option<Arc<dyn CoordinationStore>>,
    },
}

impl StoreOptions {
    pub fn connection(host: impl Into<String>, port: u16) -> Self {
        StoreOptions::Connection {
            host: host.into(),
            port,
        }
    }

    /// One handle for everything.
    pub fn shared(store: Arc<dyn CoordinationStore>) -> Self {
        StoreOptions::Handles {
            command: store,
            publisher: None,
            subscriber: None,
        }
    }
}

/// Raw shaper options, as a caller or a config file would supply them.
///
/// Nothing is checked until [`validate`](ShaperOptions::validate), which
/// [`TrafficShaper::new`](crate::TrafficShaper::new) calls for you.
#[derive(Debug, Clone)]
pub struct ShaperOptions {
    pub namespace: String,
    /// Cap on in-flight calls per key. Selects concurrency-cap mode.
    pub capacity: Option<u64>,
    pub history_ms: u64,
    /// Retention of in-flight entries. Defaults to `history_ms`.
    pub concurrency_history_ms: Option<u64>,
    pub gain: f64,
    pub max_regulated_delay_ms: u64,
    pub timeout_ms: u64,
    pub pacing: Pacing,
    pub store: StoreOptions,
}

impl ShaperOptions {
    pub fn new(store: StoreOptions) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            capacity: None,
            history_ms: DEFAULT_HISTORY_MS,
            concurrency_history_ms: None,
            gain: DEFAULT_GAIN,
            max_regulated_delay_ms: DEFAULT_MAX_REGULATED_DELAY_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            pacing: Pacing::default(),
            store,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Switch to concurrency-cap mode with at most `capacity` calls in flight
    /// per key.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_history_ms(mut self, history_ms: u64) -> Self {
        self.history_ms = history_ms;
        self
    }

    /// How long an un-acked slot lives before other callers reclaim it.
    pub fn with_concurrency_history_ms(mut self, history_ms: u64) -> Self {
        self.concurrency_history_ms = Some(history_ms);
        self
    }

    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_max_regulated_delay_ms(mut self, max_regulated_delay_ms: u64) -> Self {
        self.max_regulated_delay_ms = max_regulated_delay_ms;
        self
    }

    /// Upper bound on every store round trip and on waiting for a slot.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Check every option and freeze them.
    pub fn validate(self) -> Result<ShaperConfig, ShapeError> {
        if self.namespace.is_empty() {
            return Err(invalid("namespace must not be empty"));
        }
        let timeout = positive_ms("timeout_ms", self.timeout_ms)?;
        let history = positive_ms("history_ms", self.history_ms)?;

        let mode = match self.capacity {
            Some(capacity) if capacity <= 1 => {
                return Err(invalid(format!(
                    "capacity must be an integer greater than 1, got {capacity}"
                )));
            }
            Some(capacity) => {
                let retention = match self.concurrency_history_ms {
                    Some(ms) => positive_ms("concurrency_history_ms", ms)?,
                    None => history,
                };
                Mode::ConcurrencyCap {
                    capacity: NonZeroU64::new(capacity)
                        .ok_or_else(|| invalid("capacity must not be zero"))?,
                    retention,
                }
            }
            None => Mode::Pacing(match self.pacing {
                Pacing::MedianGap => PacingStrategy::MedianGap,
                Pacing::MeanGap => PacingStrategy::MeanGap,
                Pacing::Gain => {
                    if !(self.gain > 0.0 && self.gain < 1.0) {
                        return Err(invalid(format!(
                            "gain must lie strictly between 0 and 1, got {}",
                            self.gain
                        )));
                    }
                    PacingStrategy::Gain {
                        gain: self.gain,
                        max_regulated_delay: positive_ms(
                            "max_regulated_delay_ms",
                            self.max_regulated_delay_ms,
                        )?,
                    }
                }
            }),
        };

        let store = match self.store {
            StoreOptions::Connection { host, port } => {
                if host.is_empty() || port == 0 {
                    return Err(invalid("store connection needs a host and a non-zero port"));
                }
                connect(&host, port)?
            }
            StoreOptions::Handles {
                command,
                publisher,
                subscriber,
            } => StoreHandles {
                publisher: publisher.unwrap_or_else(|| command.clone()),
                subscriber: subscriber.unwrap_or_else(|| command.clone()),
                command,
            },
        };

        Ok(ShaperConfig {
            namespace: self.namespace,
            mode,
            history,
            timeout,
            store,
        })
    }
}

/// What a validated shaper does with each call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    Pacing(PacingStrategy),
    ConcurrencyCap {
        capacity: NonZeroU64,
        retention: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct StoreHandles {
    pub command: Arc<dyn CoordinationStore>,
    pub publisher: Arc<dyn CoordinationStore>,
    pub subscriber: Arc<dyn CoordinationStore>,
}

/// Validated, read-only shaper configuration.
#[derive(Debug, Clone)]
pub struct ShaperConfig {
    namespace: String,
    mode: Mode,
    history: Duration,
    timeout: Duration,
    store: StoreHandles,
}

impl ShaperConfig {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn history(&self) -> Duration {
        self.history
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn store(&self) -> &StoreHandles {
        &self.store
    }
}

fn invalid(reason: impl Into<String>) -> ShapeError {
    ShapeError::InvalidConfig(reason.into())
}

fn positive_ms(name: &str, ms: u64) -> Result<Duration, ShapeError> {
    if ms == 0 {
        return Err(invalid(format!("{name} must be an integer greater than 0")));
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(feature = "redis")]
fn connect(host: &str, port: u16) -> Result<StoreHandles, ShapeError> {
    let store: Arc<dyn CoordinationStore> = Arc::new(
        crate::store::RedisStore::open(host, port).map_err(|err| invalid(err.to_string()))?,
    );
    Ok(StoreHandles {
        command: store.clone(),
        publisher: store.clone(),
        subscriber: store,
    })
}

#[cfg(not(feature = "redis"))]
fn connect(host: &str, port: u16) -> Result<StoreHandles, ShapeError> {
    Err(invalid(format!(
        "cannot connect to {host}:{port}: built without the `redis` feature"
    )))
}
