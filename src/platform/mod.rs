// 外部平台模块
// 身份网关、资料存储、消息存储、变更通道、文件存储的接口定义及其实现

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};

pub mod identity;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod realtime;
pub mod storage;

pub use models::{
    AuthResponse, ChangeEvent, ChangeFilter, Identity, Location, Message, NewMessage, NewProfile,
    Presence, Profile, ProfileUpdate, Role, UserLocation,
};
pub use realtime::Subscription;

use crate::config::Config;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("realtime channel error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("invalid payload: {0}")]
    Serialization(#[from] serde_json::Error),
    /// 上游返回的错误，原样保留其消息
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("invalid or expired token")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Rejected(String),
}

pub trait IdentityGateway: Send + Sync {
    /// 校验 bearer token 并返回对应身份
    fn get_user(&self, token: &str) -> BoxFuture<'_, PlatformResult<Identity>>;

    /// 管理员创建账号，邮箱直接视为已验证
    fn admin_create_user(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'_, PlatformResult<Identity>>;

    fn admin_list_users(&self) -> BoxFuture<'_, PlatformResult<Vec<Identity>>>;

    fn admin_delete_user(&self, id: &str) -> BoxFuture<'_, PlatformResult<()>>;

    fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> BoxFuture<'_, PlatformResult<AuthResponse>>;

    fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'_, PlatformResult<AuthResponse>>;

    fn sign_out(&self, token: &str) -> BoxFuture<'_, PlatformResult<()>>;
}

pub trait ProfileStore: Send + Sync {
    fn get_profile(&self, id: &str) -> BoxFuture<'_, PlatformResult<Option<Profile>>>;

    fn list_profiles(&self) -> BoxFuture<'_, PlatformResult<Vec<Profile>>>;

    /// 除指定用户外所有人的位置投影
    fn list_locations_excluding(&self, id: &str)
    -> BoxFuture<'_, PlatformResult<Vec<UserLocation>>>;

    fn insert_profile(&self, profile: &NewProfile) -> BoxFuture<'_, PlatformResult<Profile>>;

    /// location 与 updated_at 在同一次写入中更新
    fn update_location(
        &self,
        id: &str,
        location: Location,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'_, PlatformResult<()>>;

    fn update_status(&self, id: &str, status: Presence) -> BoxFuture<'_, PlatformResult<()>>;

    fn update_details(
        &self,
        id: &str,
        update: &ProfileUpdate,
    ) -> BoxFuture<'_, PlatformResult<()>>;

    fn delete_profile(&self, id: &str) -> BoxFuture<'_, PlatformResult<()>>;
}

pub trait MessageStore: Send + Sync {
    /// 两人之间的全部消息，按 created_at 升序
    fn list_conversation(&self, a: &str, b: &str) -> BoxFuture<'_, PlatformResult<Vec<Message>>>;

    fn insert_message(&self, message: &NewMessage) -> BoxFuture<'_, PlatformResult<Message>>;

    /// 一次调用批量标记已读
    fn mark_read(&self, ids: &[String]) -> BoxFuture<'_, PlatformResult<()>>;
}

pub trait ChangeFeed: Send + Sync {
    fn publish(&self, event: &ChangeEvent) -> BoxFuture<'_, PlatformResult<()>>;

    fn subscribe(&self, filter: ChangeFilter) -> BoxFuture<'_, PlatformResult<Subscription>>;
}

pub trait BlobStore: Send + Sync {
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> BoxFuture<'_, PlatformResult<()>>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// 显式构造并注入各组件的平台客户端集合
#[derive(Clone)]
pub struct Platform {
    pub identity: Arc<dyn IdentityGateway>,
    pub profiles: Arc<dyn ProfileStore>,
    pub messages: Arc<dyn MessageStore>,
    pub changes: Arc<dyn ChangeFeed>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Platform {
    /// 连接真实后端，`api_key` 决定权限（服务端密钥或公开密钥）
    pub async fn connect(config: &Config, api_key: &str) -> PlatformResult<Self> {
        let changes: Arc<dyn ChangeFeed> = match &config.redis_url {
            Some(url) => {
                tracing::info!("Using redis change feed on channel {}", config.realtime_channel);
                Arc::new(realtime::RedisChangeFeed::connect(url, &config.realtime_channel).await?)
            }
            None => {
                tracing::info!("REDIS_URL not set, using in-process change feed");
                Arc::new(realtime::LocalChangeFeed::new())
            }
        };

        let pool = postgres::connect(config).await?;
        let http = reqwest::Client::new();

        Ok(Self {
            identity: Arc::new(identity::RemoteIdentityGateway::new(
                http.clone(),
                &config.platform_url,
                api_key,
            )),
            profiles: Arc::new(postgres::PgProfileStore::new(pool.clone(), changes.clone())),
            messages: Arc::new(postgres::PgMessageStore::new(pool, changes.clone())),
            changes,
            blobs: Arc::new(storage::RemoteBlobStore::new(
                http,
                &config.platform_url,
                api_key,
            )),
        })
    }

    /// 使用公开密钥连接，供客户端会话使用
    pub async fn connect_public(config: &Config) -> PlatformResult<Self> {
        let key = config
            .anon_key
            .clone()
            .ok_or_else(|| PlatformError::Rejected("PLATFORM_ANON_KEY is not set".into()))?;
        Self::connect(config, &key).await
    }

    /// 全部使用内存实现，删除身份时级联删除资料
    pub fn in_memory(jwt_secret: &str) -> Self {
        let changes = Arc::new(realtime::LocalChangeFeed::new());
        let profiles = Arc::new(memory::InMemoryProfileStore::new(changes.clone()));
        let identity = memory::InMemoryIdentityGateway::new(jwt_secret)
            .with_cascade(profiles.clone() as Arc<dyn ProfileStore>);

        Self {
            identity: Arc::new(identity),
            profiles,
            messages: Arc::new(memory::InMemoryMessageStore::new(changes.clone())),
            changes,
            blobs: Arc::new(memory::InMemoryBlobStore::new("memory://storage")),
        }
    }
}
