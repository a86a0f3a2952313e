use serde::{Deserialize, Serialize};

use crate::platform::{Identity, Profile};

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub username: Option<String>,
}

impl CreateUserRequest {
    // 空字符串与缺失同样处理
    pub fn required_fields(&self) -> Option<(&str, &str, &str)> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|value| !value.is_empty())
        }
        Some((
            present(&self.email)?,
            present(&self.password)?,
            present(&self.username)?,
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub message: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// 资料加上身份网关中的邮箱；没有对应身份时不输出 email 字段
#[derive(Debug, Serialize)]
pub struct AdminUser {
    #[serde(flatten)]
    pub profile: Profile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// 以资料为主表，按 id 左连接身份
pub fn attach_emails(profiles: Vec<Profile>, identities: &[Identity]) -> Vec<AdminUser> {
    profiles
        .into_iter()
        .map(|profile| {
            let email = identities
                .iter()
                .find(|identity| identity.id == profile.id)
                .and_then(|identity| identity.email.clone());
            AdminUser { profile, email }
        })
        .collect()
}
