use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::ShapeError;
use crate::history::HistoryEntry;
use crate::history::HistoryStore;
use crate::store::CoordinationStore;
use crate::store::Script;
use crate::store::ScriptContext;
use crate::store::StoreError;

/// How a pacing shaper turns recent traffic into a recommended delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacingStrategy {
    /// Pace callers to the median gap between recent calls.
    ///
    /// The median keeps a single outlier gap from dragging the pace around.
    MedianGap,
    /// Pace callers to the mean gap between recent calls.
    MeanGap,
    /// An exponentially weighted gap estimate, updated inside the store in a
    /// single round trip.
    Gain {
        /// Weight given to each new observation, in `(0, 1)`.
        gain: f64,
        /// Upper bound on any delay handed out.
        max_regulated_delay: Duration,
    },
}

/// Median-gap delay in microseconds for a call arriving at `now`.
///
/// `history` holds the calls seen before this one, oldest first.
pub fn median_gap_delay(history: &[HistoryEntry], now: i64) -> i64 {
    let Some(mut gaps) = gaps(history) else {
        return 0;
    };
    gaps.sort_unstable();
    let median = gaps[gaps.len() / 2];
    delay_towards(median, history, now)
}

/// Mean-gap delay in microseconds for a call arriving at `now`.
pub fn mean_gap_delay(history: &[HistoryEntry], now: i64) -> i64 {
    let Some(gaps) = gaps(history) else {
        return 0;
    };
    let mean = gaps.iter().sum::<i64>() / gaps.len() as i64;
    delay_towards(mean, history, now)
}

fn gaps(history: &[HistoryEntry]) -> Option<Vec<i64>> {
    if history.len() < 2 {
        return None;
    }
    Some(
        history
            .windows(2)
            .map(|pair| pair[1].timestamp_micros - pair[0].timestamp_micros)
            .collect(),
    )
}

fn delay_towards(typical_gap: i64, history: &[HistoryEntry], now: i64) -> i64 {
    let last = history.last().map_or(now, |entry| entry.timestamp_micros);
    (typical_gap - (now - last)).max(0)
}

/// Round a delay in microseconds to the millisecond a caller will sleep for.
pub fn to_sleep(delay_micros: i64) -> Duration {
    let millis = (delay_micros.max(0) + 500) / 1000;
    Duration::from_millis(millis as u64)
}

/// Server-side gain predictor.
///
/// `KEYS`: previous timestamp slot, prediction slot.
/// `ARGV`: now (µs), gain, maximum delay (µs), slot expiry (ms).
pub const GAIN_SCRIPT: Script = Script {
    name: "shape_limit_gain_delay",
    lua: r#"
local prev = tonumber(redis.call('GET', KEYS[1]))
local prediction = tonumber(redis.call('GET', KEYS[2]))
local now = tonumber(ARGV[1])
local gain = tonumber(ARGV[2])
local max_delay = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local delay = 0
if prev then
  local gap = now - prev
  local observed = math.max(gap, 0)
  if prediction then
    prediction = prediction + gain * (observed - prediction)
  else
    prediction = observed
  end
  delay = math.min(math.max(prediction - gap, 0), max_delay)
  redis.call('SET', KEYS[2], string.format('%.6f', prediction), 'PX', ttl)
end
redis.call('SET', KEYS[1], string.format('%.0f', now + delay), 'PX', ttl)
return math.floor(delay)
"#,
};

/// Native rendition of [`GAIN_SCRIPT`] for stores without Lua.
pub(crate) fn gain_script(
    ctx: &mut dyn ScriptContext,
    keys: &[String],
    args: &[String],
) -> Result<i64, StoreError> {
    let [prev_key, prediction_key] = keys else {
        return Err(StoreError::Command(format!(
            "ERR gain script expects 2 keys, got {}",
            keys.len()
        )));
    };
    let [now, gain, max_delay, ttl] = args else {
        return Err(StoreError::Command(format!(
            "ERR gain script expects 4 args, got {}",
            args.len()
        )));
    };
    let now: f64 = number(now)?;
    let gain: f64 = number(gain)?;
    let max_delay: f64 = number(max_delay)?;
    let ttl = Duration::from_millis(number::<u64>(ttl)?);

    let prev = ctx.get(prev_key)?.map(|v| number::<f64>(&v)).transpose()?;
    let prediction = ctx
        .get(prediction_key)?
        .map(|v| number::<f64>(&v))
        .transpose()?;

    let mut delay = 0.0;
    if let Some(prev) = prev {
        let gap = now - prev;
        let observed = gap.max(0.0);
        let prediction = match prediction {
            Some(prediction) => prediction + gain * (observed - prediction),
            None => observed,
        };
        delay = (prediction - gap).max(0.0).min(max_delay);
        ctx.set(prediction_key, format!("{prediction:.6}"));
        ctx.expire(prediction_key, ttl);
    }
    ctx.set(prev_key, format!("{:.0}", now + delay));
    ctx.expire(prev_key, ttl);

    Ok(delay.floor() as i64)
}

fn number<T: std::str::FromStr>(value: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Command(format!("ERR value is not a number: {value}")))
}

/// Computes pacing delays for one shaper.
#[derive(Debug, Clone)]
pub struct DelayPredictor {
    strategy: PacingStrategy,
    history: HistoryStore,
    store: Arc<dyn CoordinationStore>,
    retention: Duration,
    timeout: Duration,
}

impl DelayPredictor {
    pub fn new(
        strategy: PacingStrategy,
        store: Arc<dyn CoordinationStore>,
        retention: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            strategy,
            history: HistoryStore::new(store.clone()),
            store,
            retention,
            timeout,
        }
    }

    pub fn strategy(&self) -> PacingStrategy {
        self.strategy
    }

    /// Record a call on `key` at `now` and return the delay, in microseconds,
    /// the caller should wait before issuing it.
    ///
    /// # Errors
    ///
    /// `Timeout` if the store does not answer in time, `ShapingUnavailable`
    /// if it fails. Nothing is retried.
    pub async fn delay(&self, key: &str, request_id: &str, now: i64) -> Result<i64, ShapeError> {
        let delay = timeout(self.timeout, self.decide(key, request_id, now))
            .await?
            .map_err(ShapeError::unavailable)?;
        debug!(key, delay_us = delay, strategy = ?self.strategy, "pacing delay");
        Ok(delay)
    }

    async fn decide(&self, key: &str, request_id: &str, now: i64) -> Result<i64, ShapeError> {
        match self.strategy {
            PacingStrategy::MedianGap => {
                let history = self.history.record(key, request_id, now, self.retention).await?;
                Ok(median_gap_delay(&history, now))
            }
            PacingStrategy::MeanGap => {
                let history = self.history.record(key, request_id, now, self.retention).await?;
                Ok(mean_gap_delay(&history, now))
            }
            PacingStrategy::Gain {
                gain,
                max_regulated_delay,
            } => {
                let max_delay = max_regulated_delay.as_micros() as i64;
                let keys = [format!("prevTimestamp_{key}"), format!("prediction_{key}")];
                let args = [
                    now.to_string(),
                    gain.to_string(),
                    max_delay.to_string(),
                    self.retention.as_millis().to_string(),
                ];
                let delay = self.store.eval(&GAIN_SCRIPT, &keys, &args).await?;
                Ok(delay.clamp(0, max_delay))
            }
        }
    }
}
