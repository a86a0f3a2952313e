// 内存版平台实现，用于本地开发和测试

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AuthResponse, BlobStore, BoxFuture, ChangeEvent, ChangeFeed, Identity, IdentityGateway,
    Location, Message, MessageStore, NewMessage, NewProfile, PlatformError, PlatformResult,
    Presence, Profile, ProfileStore, ProfileUpdate, Role, UserLocation,
};

// bcrypt 允许的最低成本，内存实现不需要更高
const PASSWORD_HASH_COST: u32 = 4;
const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    jti: String,
    iat: i64,
    exp: i64,
}

struct Account {
    identity: Identity,
    password_hash: String,
}

/// 内存身份网关：bcrypt 保存密码，签发 HS256 JWT
pub struct InMemoryIdentityGateway {
    secret: String,
    token_ttl: Duration,
    accounts: RwLock<Vec<Account>>,
    revoked: RwLock<HashSet<String>>,
    cascade: Option<Arc<dyn ProfileStore>>,
}

impl InMemoryIdentityGateway {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            token_ttl: Duration::hours(1),
            accounts: RwLock::new(Vec::new()),
            revoked: RwLock::new(HashSet::new()),
            cascade: None,
        }
    }

    /// 删除身份时同时删除对应资料
    pub fn with_cascade(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.cascade = Some(profiles);
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    fn issue_token(&self, identity: &Identity) -> PlatformResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: identity.id.clone(),
            email: identity.email.clone().unwrap_or_default(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + self.token_ttl).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| PlatformError::Rejected(format!("failed to issue token: {}", e)))
    }

    async fn create_account(&self, email: &str, password: &str) -> PlatformResult<Identity> {
        if !email.contains('@') {
            return Err(PlatformError::Rejected(
                "Unable to validate email address: invalid format".into(),
            ));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(PlatformError::Rejected(format!(
                "Password should be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let password_hash = bcrypt::hash(password, PASSWORD_HASH_COST)
            .map_err(|e| PlatformError::Rejected(format!("Failed to hash password: {}", e)))?;

        let mut accounts = self.accounts.write().await;
        if accounts
            .iter()
            .any(|account| account.identity.email.as_deref() == Some(email))
        {
            return Err(PlatformError::Rejected(
                "A user with this email address has already been registered".into(),
            ));
        }

        let identity = Identity {
            id: Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
        };
        accounts.push(Account {
            identity: identity.clone(),
            password_hash,
        });
        tracing::debug!("Created identity {}", identity.id);
        Ok(identity)
    }
}

impl IdentityGateway for InMemoryIdentityGateway {
    fn get_user(&self, token: &str) -> BoxFuture<'_, PlatformResult<Identity>> {
        let token = token.to_string();
        Box::pin(async move {
            if self.revoked.read().await.contains(&token) {
                return Err(PlatformError::Unauthorized);
            }
            let claims = decode::<Claims>(
                &token,
                &DecodingKey::from_secret(self.secret.as_bytes()),
                &Validation::default(),
            )
            .map_err(|_| PlatformError::Unauthorized)?
            .claims;

            self.accounts
                .read()
                .await
                .iter()
                .find(|account| account.identity.id == claims.sub)
                .map(|account| account.identity.clone())
                .ok_or(PlatformError::Unauthorized)
        })
    }

    fn admin_create_user(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'_, PlatformResult<Identity>> {
        let (email, password) = (email.to_string(), password.to_string());
        Box::pin(async move { self.create_account(&email, &password).await })
    }

    fn admin_list_users(&self) -> BoxFuture<'_, PlatformResult<Vec<Identity>>> {
        Box::pin(async move {
            Ok(self
                .accounts
                .read()
                .await
                .iter()
                .map(|account| account.identity.clone())
                .collect())
        })
    }

    fn admin_delete_user(&self, id: &str) -> BoxFuture<'_, PlatformResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            {
                let mut accounts = self.accounts.write().await;
                let before = accounts.len();
                accounts.retain(|account| account.identity.id != id);
                if accounts.len() == before {
                    return Err(PlatformError::NotFound("User".into()));
                }
            }

            if let Some(profiles) = &self.cascade {
                if let Err(e) = profiles.delete_profile(&id).await {
                    tracing::warn!("Cascade delete of profile {} failed: {}", id, e);
                }
            }
            Ok(())
        })
    }

    fn sign_up(
        &self,
        email: &str,
        password: &str,
        _username: &str,
    ) -> BoxFuture<'_, PlatformResult<AuthResponse>> {
        let (email, password) = (email.to_string(), password.to_string());
        Box::pin(async move {
            let identity = self.create_account(&email, &password).await?;
            let token = self.issue_token(&identity)?;
            Ok(AuthResponse {
                identity,
                access_token: Some(token),
            })
        })
    }

    fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'_, PlatformResult<AuthResponse>> {
        let (email, password) = (email.to_string(), password.to_string());
        Box::pin(async move {
            let identity = {
                let accounts = self.accounts.read().await;
                let account = accounts
                    .iter()
                    .find(|account| account.identity.email.as_deref() == Some(email.as_str()));
                match account {
                    Some(account)
                        if bcrypt::verify(&password, &account.password_hash).unwrap_or(false) =>
                    {
                        account.identity.clone()
                    }
                    _ => return Err(PlatformError::Rejected("Invalid login credentials".into())),
                }
            };
            let token = self.issue_token(&identity)?;
            Ok(AuthResponse {
                identity,
                access_token: Some(token),
            })
        })
    }

    fn sign_out(&self, token: &str) -> BoxFuture<'_, PlatformResult<()>> {
        let token = token.to_string();
        Box::pin(async move {
            self.revoked.write().await.insert(token);
            Ok(())
        })
    }
}

pub struct InMemoryProfileStore {
    profiles: RwLock<Vec<Profile>>,
    changes: Arc<dyn ChangeFeed>,
}

impl InMemoryProfileStore {
    pub fn new(changes: Arc<dyn ChangeFeed>) -> Self {
        Self {
            profiles: RwLock::new(Vec::new()),
            changes,
        }
    }

    /// 直接设置角色，管理员账号只能通过这里或数据库授予
    pub async fn set_role(&self, id: &str, role: Role) -> PlatformResult<()> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .iter_mut()
            .find(|profile| profile.id == id)
            .ok_or_else(|| PlatformError::NotFound("Profile".into()))?;
        profile.role = role;
        Ok(())
    }

    // 修改并推送 UPDATE 事件；行不存在时与 SQL 一样什么都不做
    async fn modify<F>(&self, id: &str, apply: F) -> PlatformResult<()>
    where
        F: FnOnce(&mut Profile),
    {
        let updated = {
            let mut profiles = self.profiles.write().await;
            profiles.iter_mut().find(|profile| profile.id == id).map(|profile| {
                apply(profile);
                profile.clone()
            })
        };

        if let Some(profile) = updated {
            if let Err(e) = self
                .changes
                .publish(&ChangeEvent::ProfileUpdated(profile))
                .await
            {
                tracing::warn!("Failed to publish profile update: {}", e);
            }
        }
        Ok(())
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn get_profile(&self, id: &str) -> BoxFuture<'_, PlatformResult<Option<Profile>>> {
        let id = id.to_string();
        Box::pin(async move {
            Ok(self
                .profiles
                .read()
                .await
                .iter()
                .find(|profile| profile.id == id)
                .cloned())
        })
    }

    fn list_profiles(&self) -> BoxFuture<'_, PlatformResult<Vec<Profile>>> {
        Box::pin(async move { Ok(self.profiles.read().await.clone()) })
    }

    fn list_locations_excluding(
        &self,
        id: &str,
    ) -> BoxFuture<'_, PlatformResult<Vec<UserLocation>>> {
        let id = id.to_string();
        Box::pin(async move {
            Ok(self
                .profiles
                .read()
                .await
                .iter()
                .filter(|profile| profile.id != id)
                .cloned()
                .map(UserLocation::from)
                .collect())
        })
    }

    fn insert_profile(&self, profile: &NewProfile) -> BoxFuture<'_, PlatformResult<Profile>> {
        let profile = profile.clone();
        Box::pin(async move {
            let mut profiles = self.profiles.write().await;
            if profiles.iter().any(|existing| existing.id == profile.id) {
                return Err(PlatformError::Rejected(
                    "duplicate key value violates unique constraint \"profiles_pkey\"".into(),
                ));
            }
            let stored = Profile {
                id: profile.id,
                username: profile.username,
                avatar_url: None,
                location: None,
                updated_at: Utc::now(),
                status: profile.status,
                role: Role::Member,
            };
            profiles.push(stored.clone());
            Ok(stored)
        })
    }

    fn update_location(
        &self,
        id: &str,
        location: Location,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'_, PlatformResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            self.modify(&id, |profile| {
                profile.location = Some(location);
                profile.updated_at = updated_at;
            })
            .await
        })
    }

    fn update_status(&self, id: &str, status: Presence) -> BoxFuture<'_, PlatformResult<()>> {
        let id = id.to_string();
        Box::pin(async move { self.modify(&id, |profile| profile.status = status).await })
    }

    fn update_details(
        &self,
        id: &str,
        update: &ProfileUpdate,
    ) -> BoxFuture<'_, PlatformResult<()>> {
        let id = id.to_string();
        let update = update.clone();
        Box::pin(async move {
            self.modify(&id, |profile| {
                if let Some(username) = update.username {
                    profile.username = username;
                }
                if let Some(avatar_url) = update.avatar_url {
                    profile.avatar_url = Some(avatar_url);
                }
            })
            .await
        })
    }

    fn delete_profile(&self, id: &str) -> BoxFuture<'_, PlatformResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            self.profiles.write().await.retain(|profile| profile.id != id);
            Ok(())
        })
    }
}

pub struct InMemoryMessageStore {
    messages: RwLock<Vec<Message>>,
    changes: Arc<dyn ChangeFeed>,
}

impl InMemoryMessageStore {
    pub fn new(changes: Arc<dyn ChangeFeed>) -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            changes,
        }
    }
}

impl MessageStore for InMemoryMessageStore {
    fn list_conversation(&self, a: &str, b: &str) -> BoxFuture<'_, PlatformResult<Vec<Message>>> {
        let (a, b) = (a.to_string(), b.to_string());
        Box::pin(async move {
            let mut conversation: Vec<Message> = self
                .messages
                .read()
                .await
                .iter()
                .filter(|message| message.is_between(&a, &b))
                .cloned()
                .collect();
            conversation.sort_by_key(|message| message.created_at);
            Ok(conversation)
        })
    }

    fn insert_message(&self, message: &NewMessage) -> BoxFuture<'_, PlatformResult<Message>> {
        let message = message.clone();
        Box::pin(async move {
            let stored = Message {
                id: Uuid::new_v4().to_string(),
                sender_id: message.sender_id,
                receiver_id: message.receiver_id,
                content: message.content,
                created_at: message.created_at,
                read: message.read,
            };
            self.messages.write().await.push(stored.clone());

            if let Err(e) = self
                .changes
                .publish(&ChangeEvent::MessageInserted(stored.clone()))
                .await
            {
                tracing::warn!("Failed to publish message insert: {}", e);
            }
            Ok(stored)
        })
    }

    fn mark_read(&self, ids: &[String]) -> BoxFuture<'_, PlatformResult<()>> {
        let ids: HashSet<String> = ids.iter().cloned().collect();
        Box::pin(async move {
            for message in self.messages.write().await.iter_mut() {
                if ids.contains(&message.id) {
                    message.read = true;
                }
            }
            Ok(())
        })
    }
}

pub struct InMemoryBlobStore {
    base_url: String,
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryBlobStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// 读取已上传的对象及其 content type
    pub async fn object(&self, bucket: &str, path: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .read()
            .await
            .get(&format!("{}/{}", bucket, path))
            .cloned()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> BoxFuture<'_, PlatformResult<()>> {
        let key = format!("{}/{}", bucket, path);
        let content_type = content_type.to_string();
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            if objects.contains_key(&key) {
                return Err(PlatformError::Rejected("The resource already exists".into()));
            }
            objects.insert(key, (bytes, content_type));
            Ok(())
        })
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/object/public/{}/{}", self.base_url, bucket, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::realtime::LocalChangeFeed;

    fn gateway() -> InMemoryIdentityGateway {
        InMemoryIdentityGateway::new("test-secret")
    }

    #[tokio::test]
    async fn issued_token_resolves_until_signed_out() {
        let gateway = gateway();
        gateway
            .admin_create_user("a@x.com", "secret1")
            .await
            .unwrap();

        let auth = gateway
            .sign_in_with_password("a@x.com", "secret1")
            .await
            .unwrap();
        let token = auth.access_token.unwrap();
        let identity = gateway.get_user(&token).await.unwrap();
        assert_eq!(identity.email.as_deref(), Some("a@x.com"));

        gateway.sign_out(&token).await.unwrap();
        assert!(matches!(
            gateway.get_user(&token).await,
            Err(PlatformError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn wrong_password_and_garbage_tokens_are_rejected() {
        let gateway = gateway();
        gateway
            .admin_create_user("a@x.com", "secret1")
            .await
            .unwrap();

        assert!(gateway
            .sign_in_with_password("a@x.com", "wrong-password")
            .await
            .is_err());
        assert!(matches!(
            gateway.get_user("not-a-jwt").await,
            Err(PlatformError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn expired_token_is_unauthorized() {
        let gateway = gateway().with_token_ttl(Duration::hours(-2));
        let auth = gateway
            .sign_up("a@x.com", "secret1", "alice")
            .await
            .unwrap();
        let token = auth.access_token.unwrap();
        assert!(matches!(
            gateway.get_user(&token).await,
            Err(PlatformError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn duplicate_email_and_short_password_are_rejected() {
        let gateway = gateway();
        gateway
            .admin_create_user("a@x.com", "secret1")
            .await
            .unwrap();

        let duplicate = gateway.admin_create_user("a@x.com", "secret2").await;
        assert!(matches!(duplicate, Err(PlatformError::Rejected(_))));
        let short = gateway.admin_create_user("b@x.com", "123").await;
        assert!(matches!(short, Err(PlatformError::Rejected(_))));
    }

    #[tokio::test]
    async fn deleting_identity_cascades_to_profile() {
        let changes = Arc::new(LocalChangeFeed::new());
        let profiles = Arc::new(InMemoryProfileStore::new(changes));
        let gateway = gateway().with_cascade(profiles.clone());

        let identity = gateway
            .admin_create_user("a@x.com", "secret1")
            .await
            .unwrap();
        profiles
            .insert_profile(&NewProfile {
                id: identity.id.clone(),
                username: "alice".into(),
                status: Presence::Offline,
            })
            .await
            .unwrap();

        gateway.admin_delete_user(&identity.id).await.unwrap();
        assert!(profiles.get_profile(&identity.id).await.unwrap().is_none());
        assert!(matches!(
            gateway.admin_delete_user(&identity.id).await,
            Err(PlatformError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn location_update_writes_both_fields_and_publishes() {
        let changes = Arc::new(LocalChangeFeed::new());
        let profiles = InMemoryProfileStore::new(changes.clone());
        let mut subscription = changes
            .subscribe(crate::platform::ChangeFilter::ProfileUpdates)
            .await
            .unwrap();

        profiles
            .insert_profile(&NewProfile {
                id: "u1".into(),
                username: "alice".into(),
                status: Presence::Online,
            })
            .await
            .unwrap();

        let at = Utc::now() + Duration::minutes(5);
        let here = Location {
            latitude: 52.52,
            longitude: 13.405,
        };
        profiles.update_location("u1", here, at).await.unwrap();

        let stored = profiles.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(stored.location, Some(here));
        assert_eq!(stored.updated_at, at);

        match subscription.next().await {
            Some(ChangeEvent::ProfileUpdated(profile)) => assert_eq!(profile.location, Some(here)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn conversation_is_sorted_by_creation_time() {
        let store = InMemoryMessageStore::new(Arc::new(LocalChangeFeed::new()));
        let now = Utc::now();
        for (offset, content) in [(2, "third"), (0, "first"), (1, "second")] {
            store
                .insert_message(&NewMessage {
                    sender_id: "a".into(),
                    receiver_id: "b".into(),
                    content: content.into(),
                    created_at: now + Duration::seconds(offset),
                    read: false,
                })
                .await
                .unwrap();
        }
        store
            .insert_message(&NewMessage {
                sender_id: "a".into(),
                receiver_id: "c".into(),
                content: "elsewhere".into(),
                created_at: now,
                read: false,
            })
            .await
            .unwrap();

        let contents: Vec<String> = store
            .list_conversation("b", "a")
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.content)
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }
}
