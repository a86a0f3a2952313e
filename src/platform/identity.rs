use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{AuthResponse, BoxFuture, Identity, IdentityGateway, PlatformError, PlatformResult};

// 管理员分页读取用户时每页条数
const ADMIN_PAGE_SIZE: usize = 1000;

/// 通过 HTTP 调用托管身份服务
pub struct RemoteIdentityGateway {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct UserList {
    users: Vec<Identity>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    user: Option<Identity>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl RemoteIdentityGateway {
    pub fn new(http: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.base_url, path)
    }

    // 每个请求都带 apikey；bearer 缺省为当前密钥
    fn request(&self, builder: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(bearer.unwrap_or(&self.api_key))
    }
}

async fn error_from(response: Response) -> PlatformError {
    let status = response.status();
    let body = response.json::<ErrorBody>().await.unwrap_or_default();
    let message = body
        .msg
        .or(body.message)
        .or(body.error_description)
        .or(body.error)
        .unwrap_or_else(|| status.to_string());
    PlatformError::Api {
        status: status.as_u16(),
        message,
    }
}

async fn checked(response: Response) -> PlatformResult<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from(response).await)
    }
}

impl IdentityGateway for RemoteIdentityGateway {
    fn get_user(&self, token: &str) -> BoxFuture<'_, PlatformResult<Identity>> {
        let token = token.to_string();
        Box::pin(async move {
            let response = self
                .request(self.http.get(self.url("/user")), Some(&token))
                .send()
                .await?;
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) {
                return Err(PlatformError::Unauthorized);
            }
            Ok(checked(response).await?.json::<Identity>().await?)
        })
    }

    fn admin_create_user(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'_, PlatformResult<Identity>> {
        let body = json!({
            "email": email,
            "password": password,
            "email_confirm": true,
        });
        Box::pin(async move {
            let response = self
                .request(self.http.post(self.url("/admin/users")), None)
                .json(&body)
                .send()
                .await?;
            Ok(checked(response).await?.json::<Identity>().await?)
        })
    }

    fn admin_list_users(&self) -> BoxFuture<'_, PlatformResult<Vec<Identity>>> {
        Box::pin(async move {
            let mut users = Vec::new();
            let mut page = 1usize;
            loop {
                let response = self
                    .request(self.http.get(self.url("/admin/users")), None)
                    .query(&[("page", page), ("per_page", ADMIN_PAGE_SIZE)])
                    .send()
                    .await?;
                let batch = checked(response).await?.json::<UserList>().await?.users;
                let done = batch.len() < ADMIN_PAGE_SIZE;
                users.extend(batch);
                if done {
                    break;
                }
                page += 1;
            }
            tracing::debug!("Fetched {} identities", users.len());
            Ok(users)
        })
    }

    fn admin_delete_user(&self, id: &str) -> BoxFuture<'_, PlatformResult<()>> {
        let path = format!("/admin/users/{}", id);
        Box::pin(async move {
            let response = self
                .request(self.http.delete(self.url(&path)), None)
                .send()
                .await?;
            checked(response).await?;
            Ok(())
        })
    }

    fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> BoxFuture<'_, PlatformResult<AuthResponse>> {
        let body = json!({
            "email": email,
            "password": password,
            "data": { "username": username },
        });
        Box::pin(async move {
            let response = self
                .request(self.http.post(self.url("/signup")), None)
                .json(&body)
                .send()
                .await?;
            let value = checked(response).await?.json::<serde_json::Value>().await?;

            // 开启邮箱确认时直接返回用户对象，否则返回带 token 的会话
            let parsed: TokenResponse = serde_json::from_value(value.clone())?;
            let identity = match parsed.user {
                Some(user) => user,
                None => serde_json::from_value::<Identity>(value)?,
            };
            Ok(AuthResponse {
                identity,
                access_token: parsed.access_token,
            })
        })
    }

    fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'_, PlatformResult<AuthResponse>> {
        let body = json!({ "email": email, "password": password });
        Box::pin(async move {
            let response = self
                .request(self.http.post(self.url("/token")), None)
                .query(&[("grant_type", "password")])
                .json(&body)
                .send()
                .await?;
            let parsed = checked(response).await?.json::<TokenResponse>().await?;
            match (parsed.user, parsed.access_token) {
                (Some(identity), Some(token)) => Ok(AuthResponse {
                    identity,
                    access_token: Some(token),
                }),
                _ => Err(PlatformError::Rejected(
                    "sign-in response did not include a session".into(),
                )),
            }
        })
    }

    fn sign_out(&self, token: &str) -> BoxFuture<'_, PlatformResult<()>> {
        let token = token.to_string();
        Box::pin(async move {
            let response = self
                .request(self.http.post(self.url("/logout")), Some(&token))
                .send()
                .await?;
            checked(response).await?;
            Ok(())
        })
    }
}
