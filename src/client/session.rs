use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::platform::{
    Identity, NewProfile, Platform, PlatformError, Presence, ProfileUpdate,
};
use crate::utils::best_effort;

/// 头像文件大小上限 5MB
pub const MAX_AVATAR_BYTES: usize = 5 * 1024 * 1024;

/// 浏览器会话：当前身份加 bearer token，只存在于客户端
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub identity: Identity,
    pub access_token: String,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.identity.id
    }
}

#[derive(Debug)]
pub struct SignUp {
    pub identity: Identity,
    /// 网关要求邮箱确认时为 None
    pub session: Option<Session>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("User not authenticated")]
    NotSignedIn,
    #[error("{0}")]
    Invalid(String),
    /// 身份已创建但资料写入失败，身份保留
    #[error("profile creation failed: {source}")]
    ProfileCreation {
        identity: Identity,
        source: PlatformError,
    },
}

pub struct SessionManager {
    platform: Platform,
    avatar_bucket: String,
    state: watch::Sender<Option<Session>>,
}

impl SessionManager {
    pub fn new(platform: Platform, avatar_bucket: impl Into<String>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            platform,
            avatar_bucket: avatar_bucket.into(),
            state,
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    /// 订阅登录、登出、失效等状态变化
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    fn require_session(&self) -> Result<Session, SessionError> {
        self.current().ok_or(SessionError::NotSignedIn)
    }

    // 会话开始时把在线状态写为 online
    async fn start(&self, identity: Identity, access_token: String) -> Session {
        let session = Session {
            identity,
            access_token,
        };
        self.state.send_replace(Some(session.clone()));
        best_effort(
            "presence_online",
            self.platform
                .profiles
                .update_status(session.user_id(), Presence::Online),
        )
        .await;
        tracing::info!("Session started for {}", session.user_id());
        session
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, SessionError> {
        let auth = self
            .platform
            .identity
            .sign_in_with_password(email, password)
            .await?;
        let token = auth
            .access_token
            .ok_or_else(|| SessionError::Invalid("sign-in did not return a token".into()))?;
        Ok(self.start(auth.identity, token).await)
    }

    /// 创建身份后写资料（状态 online），两次写入互相独立
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<SignUp, SessionError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SessionError::Invalid("Username is required".into()));
        }

        let auth = self
            .platform
            .identity
            .sign_up(email, password, username)
            .await?;

        let profile = NewProfile {
            id: auth.identity.id.clone(),
            username: username.to_string(),
            status: Presence::Online,
        };
        if let Err(source) = self.platform.profiles.insert_profile(&profile).await {
            tracing::error!("Profile creation error for {}: {}", auth.identity.id, source);
            return Err(SessionError::ProfileCreation {
                identity: auth.identity,
                source,
            });
        }

        let session = auth.access_token.map(|token| Session {
            identity: auth.identity.clone(),
            access_token: token,
        });
        if let Some(session) = &session {
            self.state.send_replace(Some(session.clone()));
        }
        Ok(SignUp {
            identity: auth.identity,
            session,
        })
    }

    /// 用保存的 token 恢复会话；token 无效或过期时清空会话
    pub async fn restore(&self, token: &str) -> Result<Session, SessionError> {
        match self.platform.identity.get_user(token).await {
            Ok(identity) => Ok(self.start(identity, token.to_string()).await),
            Err(e) => {
                self.state.send_replace(None);
                Err(e.into())
            }
        }
    }

    /// 重新校验当前 token，失效则结束会话
    pub async fn revalidate(&self) -> bool {
        let Some(session) = self.current() else {
            return false;
        };
        match self.platform.identity.get_user(&session.access_token).await {
            Ok(_) => true,
            Err(e) => {
                tracing::info!("Session for {} expired: {}", session.user_id(), e);
                self.state.send_replace(None);
                false
            }
        }
    }

    /// 先写 offline，再调用网关登出；两者失败都只记录日志
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let session = self.require_session()?;
        best_effort(
            "presence_offline",
            self.platform
                .profiles
                .update_status(session.user_id(), Presence::Offline),
        )
        .await;
        best_effort(
            "sign_out",
            self.platform.identity.sign_out(&session.access_token),
        )
        .await;
        self.state.send_replace(None);
        tracing::info!("Session ended for {}", session.user_id());
        Ok(())
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<(), SessionError> {
        let session = self.require_session()?;
        if let Some(username) = &update.username {
            if username.trim().is_empty() {
                return Err(SessionError::Invalid("Username is required".into()));
            }
        }
        self.platform
            .profiles
            .update_details(session.user_id(), &update)
            .await?;
        Ok(())
    }

    /// 上传头像并返回公开地址，文件名取内容哈希
    pub async fn upload_avatar(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SessionError> {
        let session = self.require_session()?;
        if bytes.is_empty() {
            return Err(SessionError::Invalid("Please select an image".into()));
        }
        if bytes.len() > MAX_AVATAR_BYTES {
            return Err(SessionError::Invalid(
                "Image size must be less than 5MB".into(),
            ));
        }

        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| "bin".into());
        let digest = format!("{:x}", Sha256::digest(&bytes));
        let path = format!(
            "avatars/{}-{}.{}",
            session.user_id(),
            &digest[..16],
            extension
        );

        self.platform
            .blobs
            .upload(&self.avatar_bucket, &path, bytes, content_type)
            .await?;
        Ok(self.platform.blobs.public_url(&self.avatar_bucket, &path))
    }
}
