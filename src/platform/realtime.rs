use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::broadcast;

use super::{BoxFuture, ChangeEvent, ChangeFeed, ChangeFilter, PlatformResult};

// 进程内通道容量，超出后慢订阅者会丢失事件
const LOCAL_CHANNEL_CAPACITY: usize = 256;

/// 一次订阅，只产出匹配过滤条件的事件，drop 即取消订阅
pub struct Subscription {
    filter: ChangeFilter,
    events: BoxStream<'static, ChangeEvent>,
}

impl Subscription {
    pub fn new<S>(filter: ChangeFilter, events: S) -> Self
    where
        S: Stream<Item = ChangeEvent> + Send + 'static,
    {
        Self {
            filter,
            events: events.boxed(),
        }
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// 通道关闭时返回 None
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        while let Some(event) = self.events.next().await {
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
        None
    }
}

#[derive(Clone)]
pub struct LocalChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed for LocalChangeFeed {
    fn publish(&self, event: &ChangeEvent) -> BoxFuture<'_, PlatformResult<()>> {
        // 没有订阅者时 send 会失败，这不是错误
        let _ = self.sender.send(event.clone());
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self, filter: ChangeFilter) -> BoxFuture<'_, PlatformResult<Subscription>> {
        let receiver = self.sender.subscribe();
        Box::pin(async move {
            let events = stream::unfold(receiver, |mut receiver| async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => return Some((event, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Change subscriber lagged, skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(Subscription::new(filter, events))
        })
    }
}

/// 基于 Redis pub/sub 的变更通道，事件以 JSON 编码
pub struct RedisChangeFeed {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
    channel: String,
}

impl RedisChangeFeed {
    pub async fn connect(url: &str, channel: &str) -> PlatformResult<Self> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            publisher,
            channel: channel.to_string(),
        })
    }
}

impl ChangeFeed for RedisChangeFeed {
    fn publish(&self, event: &ChangeEvent) -> BoxFuture<'_, PlatformResult<()>> {
        let payload = serde_json::to_string(event);
        let mut conn = self.publisher.clone();
        Box::pin(async move {
            let payload = payload?;
            let _: () = conn.publish(&self.channel, payload).await?;
            Ok(())
        })
    }

    fn subscribe(&self, filter: ChangeFilter) -> BoxFuture<'_, PlatformResult<Subscription>> {
        Box::pin(async move {
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(&self.channel).await?;
            tracing::debug!("Subscribed to change channel {}", self.channel);

            let events = pubsub.into_on_message().filter_map(|msg| async move {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Unreadable change payload: {}", e);
                        return None;
                    }
                };
                match serde_json::from_str::<ChangeEvent>(&payload) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!("Discarding malformed change event: {}", e);
                        None
                    }
                }
            });
            Ok(Subscription::new(filter, events))
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::platform::{Message, Presence, Profile, Role};

    fn profile(id: &str) -> Profile {
        Profile {
            id: id.into(),
            username: id.into(),
            avatar_url: None,
            location: None,
            updated_at: Utc::now(),
            status: Presence::Online,
            role: Role::Member,
        }
    }

    #[tokio::test]
    async fn local_feed_delivers_only_matching_events() {
        let feed = LocalChangeFeed::new();
        let mut subscription = feed
            .subscribe(ChangeFilter::ProfileUpdates)
            .await
            .unwrap();

        let message = Message {
            id: "m1".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
            content: "hello".into(),
            created_at: Utc::now(),
            read: false,
        };
        feed.publish(&ChangeEvent::MessageInserted(message)).await.unwrap();
        feed.publish(&ChangeEvent::ProfileUpdated(profile("bob")))
            .await
            .unwrap();

        match subscription.next().await {
            Some(ChangeEvent::ProfileUpdated(p)) => assert_eq!(p.id, "bob"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let feed = LocalChangeFeed::new();
        assert!(feed
            .publish(&ChangeEvent::ProfileUpdated(profile("x")))
            .await
            .is_ok());
    }
}
