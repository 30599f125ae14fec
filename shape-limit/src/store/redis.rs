use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;

use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;
use futures::channel::mpsc;
use redis::FromRedisValue;
use redis::aio::MultiplexedConnection;
use redis::aio::PubSubSink;
use redis::aio::PubSubStream;
use tokio::sync::OnceCell;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::warn;

use super::Command;
use super::CoordinationStore;
use super::Messages;
use super::Reply;
use super::Script;
use super::StoreError;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::NoScriptError {
            StoreError::NoScript(err.to_string())
        } else if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Requests to the task that owns the shared pub/sub connection.
enum Control {
    Subscribe {
        channel: String,
        sender: mpsc::UnboundedSender<String>,
        done: oneshot::Sender<Result<(), StoreError>>,
    },
    Unsubscribe {
        channel: String,
    },
}

/// The shared pub/sub connection and the task routing its messages.
struct Fanout {
    control: mpsc::UnboundedSender<Control>,
    task: AbortHandle,
}

impl Drop for Fanout {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owns the pub/sub connection: subscribes channels on demand and hands each
/// message to every local subscriber of its channel.
async fn fan_out(
    mut sink: PubSubSink,
    mut messages: PubSubStream,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            request = control.next() => match request {
                Some(Control::Subscribe { channel, sender, done }) => {
                    let subscribed = if channels.contains_key(&channel) {
                        Ok(())
                    } else {
                        sink.subscribe(channel.as_str()).await.map_err(StoreError::from)
                    };
                    if subscribed.is_ok() {
                        debug!(channel, "subscribed");
                        channels.entry(channel).or_default().push(sender);
                    }
                    let _ = done.send(subscribed);
                }
                Some(Control::Unsubscribe { channel }) => {
                    let idle = channels.get_mut(&channel).is_some_and(|senders| {
                        senders.retain(|sender| !sender.is_closed());
                        senders.is_empty()
                    });
                    if idle {
                        channels.remove(&channel);
                        match sink.unsubscribe(channel.as_str()).await {
                            Ok(()) => debug!(channel, "unsubscribed"),
                            Err(err) => warn!(channel, %err, "failed to unsubscribe"),
                        }
                    }
                }
                None => break,
            },
            message = messages.next() => match message {
                Some(message) => {
                    let payload = message.get_payload::<String>().unwrap_or_default();
                    if let Some(senders) = channels.get_mut(message.get_channel_name()) {
                        senders.retain(|sender| sender.unbounded_send(payload.clone()).is_ok());
                    }
                }
                None => {
                    warn!(channels = channels.len(), "pub/sub connection closed");
                    break;
                }
            },
        }
    }
}

/// One local subscriber's view of a channel. Dropping it gives the channel
/// up once no other local subscriber wants it.
struct Subscription {
    channel: String,
    messages: mpsc::UnboundedReceiver<String>,
    control: mpsc::UnboundedSender<Control>,
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.messages.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.messages.close();
        let _ = self.control.unbounded_send(Control::Unsubscribe {
            channel: std::mem::take(&mut self.channel),
        });
    }
}

fn pubsub_closed() -> StoreError {
    StoreError::Connection("pub/sub connection closed".to_string())
}

/// A coordination store backed by a Redis server.
///
/// Commands and publishes share one multiplexed connection, opened on first
/// use. Subscriptions share one pub/sub connection, also opened on first use
/// and reopened if it is lost.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
    fanout: tokio::sync::Mutex<Option<Fanout>>,
    scripts: Mutex<HashMap<&'static str, Arc<redis::Script>>>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &self.client)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Point at `host:port`. Nothing is dialled until the first command.
    pub fn open(host: &str, port: u16) -> Result<Self, StoreError> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
        Ok(Self::new(client))
    }

    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            connection: OnceCell::new(),
            fanout: tokio::sync::Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        Ok(self
            .connection
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .cloned()?)
    }

    /// The control channel of the live pub/sub connection, dialling a new
    /// one if there is none.
    async fn fanout(&self) -> Result<mpsc::UnboundedSender<Control>, StoreError> {
        let mut fanout = self.fanout.lock().await;
        if let Some(live) = fanout.as_ref().filter(|live| !live.control.is_closed()) {
            return Ok(live.control.clone());
        }

        let (sink, messages) = self.client.get_async_pubsub().await?.split();
        let (control, requests) = mpsc::unbounded();
        let task = tokio::spawn(fan_out(sink, messages, requests));
        debug!("opened pub/sub connection");
        *fanout = Some(Fanout {
            control: control.clone(),
            task: task.abort_handle(),
        });
        Ok(control)
    }

    fn script(&self, script: &Script) -> Arc<redis::Script> {
        let mut scripts = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scripts
            .entry(script.name)
            .or_insert_with(|| Arc::new(redis::Script::new(script.lua)))
            .clone()
    }
}

fn queue(pipe: &mut redis::Pipeline, command: &Command) {
    match command {
        Command::RemoveBelow { key, below } => {
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(format!("({below}"));
        }
        Command::Range { key } => {
            pipe.cmd("ZRANGE").arg(key).arg(0).arg(-1).arg("WITHSCORES");
        }
        Command::Add { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
        }
        Command::Remove { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member);
        }
        Command::Expire { key, ttl } => {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1));
        }
    }
}

fn reply(command: &Command, value: &redis::Value) -> Result<Reply, StoreError> {
    match command {
        Command::RemoveBelow { .. } | Command::Add { .. } | Command::Remove { .. } => {
            Ok(Reply::Count(u64::from_redis_value(value)?))
        }
        Command::Range { .. } => {
            let members = Vec::<(String, f64)>::from_redis_value(value)?;
            Ok(Reply::Members(
                members
                    .into_iter()
                    .map(|(member, score)| (member, score as i64))
                    .collect(),
            ))
        }
        Command::Expire { .. } => {
            i64::from_redis_value(value)?;
            Ok(Reply::Done)
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn multi(
        &self,
        commands: Vec<Command>,
    ) -> Result<Vec<Result<Reply, StoreError>>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            queue(&mut pipe, command);
        }

        let mut connection = self.connection().await?;
        let values: Vec<redis::Value> = pipe.query_async(&mut connection).await?;
        if values.len() != commands.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "{} replies to {} commands",
                values.len(),
                commands.len()
            )));
        }

        Ok(commands
            .iter()
            .zip(&values)
            .map(|(command, value)| reply(command, value))
            .collect())
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let script = self.script(script);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let mut connection = self.connection().await?;
        let result: i64 = invocation.invoke_async(&mut connection).await?;
        Ok(result)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection().await?;
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut connection)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Messages, StoreError> {
        let control = self.fanout().await?;
        let (sender, messages) = mpsc::unbounded();
        let (done, subscribed) = oneshot::channel();
        control
            .unbounded_send(Control::Subscribe {
                channel: channel.to_string(),
                sender,
                done,
            })
            .map_err(|_| pubsub_closed())?;
        subscribed.await.map_err(|_| pubsub_closed())??;

        Ok(Subscription {
            channel: channel.to_string(),
            messages,
            control,
        }
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replies_are_decoded() {
        let range = Command::Range { key: "k".into() };
        let value = redis::Value::Array(vec![
            redis::Value::BulkString(b"a".to_vec()),
            redis::Value::BulkString(b"1500".to_vec()),
        ]);
        assert_eq!(
            reply(&range, &value).unwrap(),
            Reply::Members(vec![("a".into(), 1500)])
        );

        let remove = Command::Remove {
            key: "k".into(),
            member: "a".into(),
        };
        assert_eq!(
            reply(&remove, &redis::Value::Int(0)).unwrap(),
            Reply::Count(0)
        );
    }

    #[test]
    fn test_dropped_subscription_gives_up_its_channel() {
        let (control, mut requests) = mpsc::unbounded();
        let (sender, messages) = mpsc::unbounded();
        drop(Subscription {
            channel: "k".into(),
            messages,
            control,
        });

        // The fan-out task stops routing to it and may unsubscribe
        assert!(sender.is_closed());
        assert!(matches!(
            requests.try_next(),
            Ok(Some(Control::Unsubscribe { channel })) if channel == "k"
        ));
    }
}
