use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;

use super::Command;
use super::CoordinationStore;
use super::Messages;
use super::Reply;
use super::Script;
use super::StoreError;
use crate::Clock;
use crate::predictor::GAIN_SCRIPT;
use crate::predictor::gain_script;

/// Plain key/value access handed to native scripts.
///
/// Every call made through a context happens while the store is locked, so a
/// script observes and mutates the keyspace indivisibly.
pub trait ScriptContext {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: String);
    fn expire(&mut self, key: &str, ttl: Duration);
}

type NativeScript = Arc<
    dyn Fn(&mut dyn ScriptContext, &[String], &[String]) -> Result<i64, StoreError> + Send + Sync,
>;

#[derive(Debug, Default)]
struct SortedSet {
    ordered: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn add(&mut self, member: String, score: i64) -> u64 {
        let fresh = match self.scores.insert(member.clone(), score) {
            Some(previous) => {
                self.ordered.remove(&(previous, member.clone()));
                0
            }
            None => 1,
        };
        self.ordered.insert((score, member));
        fresh
    }

    fn remove(&mut self, member: &str) -> u64 {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                1
            }
            None => 0,
        }
    }

    fn remove_below(&mut self, below: i64) -> u64 {
        let keep = self.ordered.split_off(&(below, String::new()));
        let removed = std::mem::replace(&mut self.ordered, keep);
        for (_, member) in &removed {
            self.scores.remove(member);
        }
        removed.len() as u64
    }

    fn members(&self) -> Vec<(String, i64)> {
        self.ordered
            .iter()
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[derive(Debug)]
enum Value {
    Sorted(SortedSet),
    Text(String),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

#[derive(Debug)]
struct Keyspace<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: i64,
}

impl Keyspace<'_> {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = self.now;
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some_and(|at| at <= now))
        {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn sorted(&mut self, key: &str) -> Result<Option<&mut SortedSet>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Sorted(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_or_insert(&mut self, key: &str) -> Result<&mut SortedSet, StoreError> {
        if self.live(key).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Sorted(SortedSet::default()),
                    expires_at: None,
                },
            );
        }
        self.sorted(key)?
            .ok_or_else(|| StoreError::Command(format!("lost key {key}")))
    }

    /// Drop a sorted set once its last member is gone, as Redis does.
    fn reap(&mut self, key: &str) {
        if matches!(
            self.entries.get(key),
            Some(Entry { value: Value::Sorted(set), .. }) if set.is_empty()
        ) {
            self.entries.remove(key);
        }
    }

    fn apply(&mut self, command: Command) -> Result<Reply, StoreError> {
        match command {
            Command::RemoveBelow { key, below } => {
                let removed = self
                    .sorted(&key)?
                    .map(|set| set.remove_below(below))
                    .unwrap_or_default();
                self.reap(&key);
                Ok(Reply::Count(removed))
            }
            Command::Range { key } => Ok(Reply::Members(
                self.sorted(&key)?.map(|set| set.members()).unwrap_or_default(),
            )),
            Command::Add { key, member, score } => {
                let added = self.sorted_or_insert(&key)?.add(member, score);
                Ok(Reply::Count(added))
            }
            Command::Remove { key, member } => {
                let removed = self
                    .sorted(&key)?
                    .map(|set| set.remove(&member))
                    .unwrap_or_default();
                self.reap(&key);
                Ok(Reply::Count(removed))
            }
            Command::Expire { key, ttl } => {
                let now = self.now;
                let applied = match self.live(&key) {
                    Some(entry) => {
                        entry.expires_at = Some(now + ttl.as_micros() as i64);
                        1
                    }
                    None => 0,
                };
                Ok(Reply::Count(applied))
            }
        }
    }
}

impl ScriptContext for Keyspace<'_> {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set(&mut self, key: &str, value: String) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value),
                expires_at: None,
            },
        );
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        let now = self.now;
        if let Some(entry) = self.live(key) {
            entry.expires_at = Some(now + ttl.as_micros() as i64);
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

/// A coordination store held in process memory.
///
/// It offers the same guarantees as a networked store to every shaper that
/// shares it, which makes one `Arc<MemoryStore>` behave like a cluster of
/// processes talking to one server. Native scripts stand in for Lua; the
/// gain predictor's script is registered from the start.
pub struct MemoryStore {
    keyspace: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    scripts: Mutex<HashMap<&'static str, NativeScript>>,
    clock: Clock,
    unavailable: AtomicBool,
    latency_us: AtomicU64,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &lock(&self.keyspace).len())
            .field("channels", &lock(&self.channels).len())
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Expire keys against `clock` instead of the system clock.
    pub fn with_clock(clock: Clock) -> Self {
        let store = Self {
            keyspace: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
            latency_us: AtomicU64::new(0),
        };
        store.register(GAIN_SCRIPT.name, gain_script);
        store
    }

    /// Make `name` callable through [`CoordinationStore::eval`].
    pub fn register<F>(&self, name: &'static str, script: F)
    where
        F: Fn(&mut dyn ScriptContext, &[String], &[String]) -> Result<i64, StoreError>
            + Send
            + Sync
            + 'static,
    {
        lock(&self.scripts).insert(name, Arc::new(script));
    }

    /// Simulate an outage: every operation fails until this is reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Delay every operation by `latency` before it runs.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Store a plain string value, overwriting whatever `key` held.
    pub fn set(&self, key: &str, value: &str) {
        self.with_keyspace(|keyspace| ScriptContext::set(keyspace, key, value.to_string()));
    }

    /// Members of the sorted set at `key`, lowest score first.
    pub fn members(&self, key: &str) -> Vec<(String, i64)> {
        self.with_keyspace(|keyspace| {
            keyspace
                .sorted(key)
                .ok()
                .flatten()
                .map(|set| set.members())
                .unwrap_or_default()
        })
    }

    /// Whether `key` exists and has not expired.
    pub fn contains(&self, key: &str) -> bool {
        self.with_keyspace(|keyspace| keyspace.live(key).is_some())
    }

    fn with_keyspace<R>(&self, f: impl FnOnce(&mut Keyspace<'_>) -> R) -> R {
        let mut entries = lock(&self.keyspace);
        f(&mut Keyspace {
            entries: &mut *entries,
            now: self.clock.now_micros(),
        })
    }

    async fn round_trip(&self) -> Result<(), StoreError> {
        let latency = self.latency_us.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Connection("memory store is unavailable".into()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn multi(
        &self,
        commands: Vec<Command>,
    ) -> Result<Vec<Result<Reply, StoreError>>, StoreError> {
        self.round_trip().await?;
        Ok(self.with_keyspace(|keyspace| {
            commands
                .into_iter()
                .map(|command| keyspace.apply(command))
                .collect()
        }))
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        self.round_trip().await?;
        let native = lock(&self.scripts)
            .get(script.name)
            .cloned()
            .ok_or_else(|| StoreError::NoScript(script.name.to_string()))?;
        self.with_keyspace(|keyspace| native(keyspace, keys, args))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
        self.round_trip().await?;
        let mut channels = lock(&self.channels);
        let Some(subscribers) = channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|subscriber| subscriber.unbounded_send(message.to_string()).is_ok());
        Ok(subscribers.len() as u64)
    }

    async fn subscribe(&self, channel: &str) -> Result<Messages, StoreError> {
        self.round_trip().await?;
        let (sender, receiver) = mpsc::unbounded();
        lock(&self.channels)
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(receiver.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::FutureExt;

    fn mocked() -> (MemoryStore, Arc<quanta::Mock>) {
        let (clock, mock) = quanta::Clock::mock();
        (MemoryStore::with_clock(Clock::with_clock(clock, 0)), mock)
    }

    fn add(key: &str, member: &str, score: i64) -> Command {
        Command::Add {
            key: key.into(),
            member: member.into(),
            score,
        }
    }

    #[tokio::test]
    async fn test_sorted_set_orders_by_score() {
        let store = MemoryStore::new();
        let replies = store
            .multi(vec![
                add("k", "b", 20),
                add("k", "a", 10),
                add("k", "c", 30),
                add("k", "a", 40),
                Command::Range { key: "k".into() },
            ])
            .await
            .unwrap();

        assert_eq!(replies[0], Ok(Reply::Count(1)));
        assert_eq!(replies[3], Ok(Reply::Count(0)), "re-adding only moves the score");
        assert_eq!(
            replies[4],
            Ok(Reply::Members(vec![
                ("b".into(), 20),
                ("c".into(), 30),
                ("a".into(), 40)
            ]))
        );
    }

    #[tokio::test]
    async fn test_remove_below_is_exclusive() {
        let store = MemoryStore::new();
        store
            .multi(vec![add("k", "a", 10), add("k", "b", 20), add("k", "c", 30)])
            .await
            .unwrap();

        let replies = store
            .multi(vec![Command::RemoveBelow {
                key: "k".into(),
                below: 20,
            }])
            .await
            .unwrap();

        assert_eq!(replies[0], Ok(Reply::Count(1)));
        assert_eq!(store.members("k"), vec![("b".into(), 20), ("c".into(), 30)]);
    }

    #[tokio::test]
    async fn test_failed_sub_command_does_not_stop_the_batch() {
        let store = MemoryStore::new();
        store.set("text", "hello");

        let replies = store
            .multi(vec![
                add("text", "a", 1),
                add("zset", "a", 1),
                Command::Remove {
                    key: "zset".into(),
                    member: "missing".into(),
                },
            ])
            .await
            .unwrap();

        assert!(matches!(replies[0], Err(StoreError::Command(_))));
        assert_eq!(replies[1], Ok(Reply::Count(1)));
        assert_eq!(replies[2], Ok(Reply::Count(0)));
    }

    #[tokio::test]
    async fn test_keys_expire_against_the_clock() {
        let (store, mock) = mocked();
        store
            .multi(vec![
                add("k", "a", 1),
                Command::Expire {
                    key: "k".into(),
                    ttl: Duration::from_secs(1),
                },
            ])
            .await
            .unwrap();

        mock.increment(Duration::from_millis(999));
        assert!(store.contains("k"));
        mock.increment(Duration::from_millis(1));
        assert!(!store.contains("k"));
        assert!(store.members("k").is_empty());
    }

    #[tokio::test]
    async fn test_empty_sets_are_reaped() {
        let store = MemoryStore::new();
        store.multi(vec![add("k", "a", 1)]).await.unwrap();
        store
            .multi(vec![Command::Remove {
                key: "k".into(),
                member: "a".into(),
            }])
            .await
            .unwrap();
        assert!(!store.contains("k"));
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_everything() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.multi(vec![]).await,
            Err(StoreError::Connection(_))
        ));
        assert!(matches!(
            store.publish("c", "m").await,
            Err(StoreError::Connection(_))
        ));

        store.set_unavailable(false);
        assert!(store.multi(vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_pub_sub_fans_out() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("chan").await.unwrap();
        let mut second = store.subscribe("chan").await.unwrap();

        assert_eq!(store.publish("chan", "released").await.unwrap(), 2);
        assert_eq!(store.publish("other", "ignored").await.unwrap(), 0);

        assert_eq!(first.next().await.as_deref(), Some("released"));
        assert_eq!(second.next().await.as_deref(), Some("released"));
        assert!(first.next().now_or_never().is_none());

        drop(second);
        assert_eq!(store.publish("chan", "again").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_eval_runs_registered_scripts() {
        let store = MemoryStore::new();
        store.register("incr", |ctx, keys, _args| {
            let current: i64 = ctx
                .get(&keys[0])?
                .and_then(|value| value.parse().ok())
                .unwrap_or_default();
            ctx.set(&keys[0], (current + 1).to_string());
            Ok(current + 1)
        });
        let script = Script {
            name: "incr",
            lua: "",
        };
        let keys = vec!["n".to_string()];

        assert_eq!(store.eval(&script, &keys, &[]).await, Ok(1));
        assert_eq!(store.eval(&script, &keys, &[]).await, Ok(2));

        let unknown = Script {
            name: "nope",
            lua: "",
        };
        assert_eq!(
            store.eval(&unknown, &keys, &[]).await,
            Err(StoreError::NoScript("nope".into()))
        );
    }
}
