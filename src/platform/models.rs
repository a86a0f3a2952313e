use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// 账号身份，由身份网关持有
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// 注册或密码登录的结果
///
/// 网关要求邮箱确认时，注册不会返回 token
#[derive(Debug, Clone)]
pub struct AuthResponse {
    pub identity: Identity,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    #[default]
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
        }
    }

    // 无法识别的值一律视为离线
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("online") {
            Presence::Online
        } else {
            Presence::Offline
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "admin" { Role::Admin } else { Role::Member }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub location: Option<Location>,
    pub updated_at: DateTime<Utc>,
    pub status: Presence,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct NewProfile {
    pub id: String,
    pub username: String,
    pub status: Presence,
}

// 用户自己或管理员可修改的字段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

/// 地图标记所需的资料投影，即位置缓存中的条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLocation {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub location: Option<Location>,
    pub status: Presence,
}

impl From<Profile> for UserLocation {
    fn from(profile: Profile) -> Self {
        Self {
            id: profile.id,
            username: profile.username,
            avatar_url: profile.avatar_url,
            location: profile.location,
            status: profile.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// 变更通道推送的行级变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "record", rename_all = "snake_case")]
pub enum ChangeEvent {
    ProfileUpdated(Profile),
    MessageInserted(Message),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeFilter {
    /// profiles 表上的所有 UPDATE
    ProfileUpdates,
    /// 两个用户之间（任一方向）的 messages INSERT
    Conversation { a: String, b: String },
}

impl ChangeFilter {
    pub fn conversation(a: impl Into<String>, b: impl Into<String>) -> Self {
        ChangeFilter::Conversation {
            a: a.into(),
            b: b.into(),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match (self, event) {
            (ChangeFilter::ProfileUpdates, ChangeEvent::ProfileUpdated(_)) => true,
            (ChangeFilter::Conversation { a, b }, ChangeEvent::MessageInserted(message)) => {
                message.is_between(a, b)
            }
            _ => false,
        }
    }
}
