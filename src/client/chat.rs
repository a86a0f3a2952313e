use std::future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Session;
use crate::platform::{
    ChangeEvent, ChangeFeed, ChangeFilter, Message, MessageStore, NewMessage, Platform,
    Subscription,
};
use crate::utils::best_effort;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    /// 历史按创建时间升序，实时消息只追加不重排
    pub messages: Vec<Message>,
    pub loading: bool,
}

pub struct DirectMessages {
    messages: Arc<dyn MessageStore>,
    changes: Arc<dyn ChangeFeed>,
}

impl DirectMessages {
    pub fn new(platform: &Platform) -> Self {
        Self {
            messages: platform.messages.clone(),
            changes: platform.changes.clone(),
        }
    }

    /// 打开与 `peer_id` 的会话：先订阅，再拉历史并批量标记已读
    pub async fn open(&self, session: &Session, peer_id: &str) -> Conversation {
        let self_id = session.user_id().to_string();
        let peer_id = peer_id.to_string();

        let subscription = match self
            .changes
            .subscribe(ChangeFilter::conversation(self_id.clone(), peer_id.clone()))
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::error!("Failed to subscribe to messages with {}: {}", peer_id, e);
                None
            }
        };

        let (state_tx, state_rx) = watch::channel(ConversationState {
            messages: Vec::new(),
            loading: true,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor = ConversationActor {
            self_id: self_id.clone(),
            peer_id: peer_id.clone(),
            store: self.messages.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(actor.run(subscription, shutdown_rx));

        Conversation {
            self_id,
            peer_id,
            store: self.messages.clone(),
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct Conversation {
    self_id: String,
    peer_id: String,
    store: Arc<dyn MessageStore>,
    state: watch::Receiver<ConversationState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Conversation {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.borrow().messages.clone()
    }

    /// 发送输入框内容。空白内容直接拒绝；写入失败只记录日志，输入框总会被清空。
    ///
    /// 不在本地追加，自己的消息依赖订阅回显。
    pub async fn send(&self, draft: &mut String) -> Result<(), ChatError> {
        let content = draft.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = NewMessage {
            sender_id: self.self_id.clone(),
            receiver_id: self.peer_id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            read: false,
        };
        best_effort("send_message", self.store.insert_message(&message)).await;
        draft.clear();
        Ok(())
    }

    /// 关闭会话，返回后不会再追加消息
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Conversation task failed: {}", e);
        }
    }
}

struct ConversationActor {
    self_id: String,
    peer_id: String,
    store: Arc<dyn MessageStore>,
    state: watch::Sender<ConversationState>,
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => future::pending().await,
    }
}

impl ConversationActor {
    async fn run(self, mut subscription: Option<Subscription>, mut shutdown: watch::Receiver<bool>) {
        let fetched = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            result = self.store.list_conversation(&self.self_id, &self.peer_id) => result,
        };
        let history = fetched.unwrap_or_else(|e| {
            tracing::error!("Error fetching messages with {}: {}", self.peer_id, e);
            Vec::new()
        });

        let unread: Vec<String> = history
            .iter()
            .filter(|message| message.receiver_id == self.self_id && !message.read)
            .map(|message| message.id.clone())
            .collect();
        if !unread.is_empty() {
            best_effort("mark_read", self.store.mark_read(&unread)).await;
        }

        self.state.send_modify(|state| {
            state.messages = history;
            state.loading = false;
        });

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = next_event(&mut subscription) => match event {
                    Some(ChangeEvent::MessageInserted(message)) => self.append(message).await,
                    Some(_) => {}
                    None => {
                        tracing::warn!("Message subscription with {} closed", self.peer_id);
                        subscription = None;
                    }
                },
            }
        }
    }

    // 订阅至少一次投递，已有 id 的消息忽略
    async fn append(&self, message: Message) {
        let appended = self.state.send_if_modified(|state| {
            if state.messages.iter().any(|existing| existing.id == message.id) {
                return false;
            }
            state.messages.push(message.clone());
            true
        });
        if !appended {
            tracing::debug!("Ignoring duplicate message {}", message.id);
            return;
        }

        if message.receiver_id == self.self_id {
            best_effort("mark_read", self.store.mark_read(&[message.id])).await;
        }
    }
}
