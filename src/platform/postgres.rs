use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Executor, FromRow};

use super::{
    BoxFuture, ChangeEvent, ChangeFeed, Location, Message, MessageStore, NewMessage, NewProfile,
    Presence, Profile, ProfileStore, ProfileUpdate, PlatformResult, Role, UserLocation,
};
use crate::config::Config;

pub async fn connect(config: &Config) -> PlatformResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'geochat';").await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

// id 列为 uuid，统一转成 text 读出
const PROFILE_COLUMNS: &str =
    "id::text AS id, username, avatar_url, location, updated_at, status, role";

const MESSAGE_COLUMNS: &str = "id::text AS id, sender_id::text AS sender_id, \
     receiver_id::text AS receiver_id, content, created_at, read";

#[derive(Debug, FromRow)]
struct ProfileRow {
    id: String,
    username: String,
    avatar_url: Option<String>,
    location: Option<Json<Location>>,
    updated_at: DateTime<Utc>,
    status: String,
    role: String,
}

impl From<ProfileRow> for Profile {
    fn from(row: ProfileRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            avatar_url: row.avatar_url,
            location: row.location.map(|Json(location)| location),
            updated_at: row.updated_at,
            status: Presence::parse(&row.status),
            role: Role::parse(&row.role),
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    sender_id: String,
    receiver_id: String,
    content: String,
    created_at: DateTime<Utc>,
    read: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            created_at: row.created_at,
            read: row.read,
        }
    }
}

pub struct PgProfileStore {
    pool: PgPool,
    changes: Arc<dyn ChangeFeed>,
}

impl PgProfileStore {
    pub fn new(pool: PgPool, changes: Arc<dyn ChangeFeed>) -> Self {
        Self { pool, changes }
    }

    // 更新成功后推送 UPDATE 事件，推送失败只记录日志
    async fn announce(&self, row: Option<ProfileRow>) {
        let Some(row) = row else {
            return;
        };
        let event = ChangeEvent::ProfileUpdated(row.into());
        if let Err(e) = self.changes.publish(&event).await {
            tracing::warn!("Failed to publish profile update: {}", e);
        }
    }
}

impl ProfileStore for PgProfileStore {
    fn get_profile(&self, id: &str) -> BoxFuture<'_, PlatformResult<Option<Profile>>> {
        let id = id.to_string();
        Box::pin(async move {
            let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1::uuid");
            let row = sqlx::query_as::<_, ProfileRow>(&query)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(Profile::from))
        })
    }

    fn list_profiles(&self) -> BoxFuture<'_, PlatformResult<Vec<Profile>>> {
        Box::pin(async move {
            let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles");
            let rows = sqlx::query_as::<_, ProfileRow>(&query)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows.into_iter().map(Profile::from).collect())
        })
    }

    fn list_locations_excluding(
        &self,
        id: &str,
    ) -> BoxFuture<'_, PlatformResult<Vec<UserLocation>>> {
        let id = id.to_string();
        Box::pin(async move {
            let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id <> $1::uuid");
            let rows = sqlx::query_as::<_, ProfileRow>(&query)
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .into_iter()
                .map(|row| UserLocation::from(Profile::from(row)))
                .collect())
        })
    }

    fn insert_profile(&self, profile: &NewProfile) -> BoxFuture<'_, PlatformResult<Profile>> {
        let profile = profile.clone();
        Box::pin(async move {
            let query = format!(
                "INSERT INTO profiles (id, username, status) VALUES ($1::uuid, $2, $3) \
                 RETURNING {PROFILE_COLUMNS}"
            );
            let row = sqlx::query_as::<_, ProfileRow>(&query)
                .bind(&profile.id)
                .bind(&profile.username)
                .bind(profile.status.as_str())
                .fetch_one(&self.pool)
                .await?;
            Ok(row.into())
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
            let query = format!(
                "UPDATE profiles SET location = $2, updated_at = $3 WHERE id = $1::uuid \
                 RETURNING {PROFILE_COLUMNS}"
            );
            let row = sqlx::query_as::<_, ProfileRow>(&query)
                .bind(id)
                .bind(Json(location))
                .bind(updated_at)
                .fetch_optional(&self.pool)
                .await?;
            self.announce(row).await;
            Ok(())
        })
    }

    fn update_status(&self, id: &str, status: Presence) -> BoxFuture<'_, PlatformResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            let query = format!(
                "UPDATE profiles SET status = $2 WHERE id = $1::uuid RETURNING {PROFILE_COLUMNS}"
            );
            let row = sqlx::query_as::<_, ProfileRow>(&query)
                .bind(id)
                .bind(status.as_str())
                .fetch_optional(&self.pool)
                .await?;
            self.announce(row).await;
            Ok(())
        })
    }

    fn update_details(
        &self,
        id: &str,
        update: &ProfileUpdate,
    ) -> BoxFuture<'_, PlatformResult<()>> {
        let id = id.to_string();
        let update = update.clone();
        Box::pin(async move {
            // 未提供的字段保持原值
            let query = format!(
                "UPDATE profiles SET username = COALESCE($2, username), \
                 avatar_url = COALESCE($3, avatar_url) WHERE id = $1::uuid \
                 RETURNING {PROFILE_COLUMNS}"
            );
            let row = sqlx::query_as::<_, ProfileRow>(&query)
                .bind(id)
                .bind(update.username)
                .bind(update.avatar_url)
                .fetch_optional(&self.pool)
                .await?;
            self.announce(row).await;
            Ok(())
        })
    }

    fn delete_profile(&self, id: &str) -> BoxFuture<'_, PlatformResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM profiles WHERE id = $1::uuid")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }
}

pub struct PgMessageStore {
    pool: PgPool,
    changes: Arc<dyn ChangeFeed>,
}

impl PgMessageStore {
    pub fn new(pool: PgPool, changes: Arc<dyn ChangeFeed>) -> Self {
        Self { pool, changes }
    }
}

impl MessageStore for PgMessageStore {
    fn list_conversation(&self, a: &str, b: &str) -> BoxFuture<'_, PlatformResult<Vec<Message>>> {
        let (a, b) = (a.to_string(), b.to_string());
        Box::pin(async move {
            let query = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE (sender_id = $1::uuid AND receiver_id = $2::uuid) \
                    OR (sender_id = $2::uuid AND receiver_id = $1::uuid) \
                 ORDER BY created_at ASC"
            );
            let rows = sqlx::query_as::<_, MessageRow>(&query)
                .bind(a)
                .bind(b)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows.into_iter().map(Message::from).collect())
        })
    }

    fn insert_message(&self, message: &NewMessage) -> BoxFuture<'_, PlatformResult<Message>> {
        let message = message.clone();
        Box::pin(async move {
            let query = format!(
                "INSERT INTO messages (sender_id, receiver_id, content, created_at, read) \
                 VALUES ($1::uuid, $2::uuid, $3, $4, $5) RETURNING {MESSAGE_COLUMNS}"
            );
            let row = sqlx::query_as::<_, MessageRow>(&query)
                .bind(&message.sender_id)
                .bind(&message.receiver_id)
                .bind(&message.content)
                .bind(message.created_at)
                .bind(message.read)
                .fetch_one(&self.pool)
                .await?;

            let stored = Message::from(row);
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
        let ids = ids.to_vec();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            sqlx::query("UPDATE messages SET read = true WHERE id = ANY($1::text[]::uuid[])")
                .bind(ids)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }
}
