mod common;

use std::sync::atomic::Ordering;

use geochat::client::session::MAX_AVATAR_BYTES;
use geochat::client::{SessionError, SessionManager};
use geochat::platform::{IdentityGateway, PlatformError, Presence, ProfileStore, ProfileUpdate};

use common::TestPlatform;

async fn status_of(platform: &TestPlatform, id: &str) -> Presence {
    platform
        .profile_store
        .get_profile(id)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn sign_in_marks_online_and_sign_out_marks_offline() {
    let platform = TestPlatform::new();
    let (id, _) = platform
        .register("me@example.com", "me", Presence::Offline)
        .await;
    let manager = SessionManager::new(platform.platform.clone(), "avatars");
    let mut changes = manager.subscribe();

    let session = manager.sign_in("me@example.com", "secret123").await.unwrap();
    assert_eq!(session.user_id(), id);
    assert_eq!(status_of(&platform, &id).await, Presence::Online);
    assert!(changes.has_changed().unwrap());
    assert_eq!(changes.borrow_and_update().as_ref(), Some(&session));

    manager.sign_out().await.unwrap();
    assert_eq!(status_of(&platform, &id).await, Presence::Offline);
    assert!(manager.current().is_none());
    assert!(matches!(
        platform.identity.get_user(&session.access_token).await,
        Err(PlatformError::Unauthorized)
    ));
}

#[tokio::test]
async fn wrong_password_leaves_no_session() {
    let platform = TestPlatform::new();
    platform
        .register("me@example.com", "me", Presence::Offline)
        .await;
    let manager = SessionManager::new(platform.platform.clone(), "avatars");

    let err = manager
        .sign_in("me@example.com", "wrong-password")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid login credentials");
    assert!(manager.current().is_none());
}

#[tokio::test]
async fn sign_out_without_session_is_an_error() {
    let platform = TestPlatform::new();
    let manager = SessionManager::new(platform.platform.clone(), "avatars");
    assert!(matches!(
        manager.sign_out().await,
        Err(SessionError::NotSignedIn)
    ));
    assert_eq!(platform.profiles.status_writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sign_up_creates_an_online_profile() {
    let platform = TestPlatform::new();
    let manager = SessionManager::new(platform.platform.clone(), "avatars");

    let signed_up = manager
        .sign_up("new@example.com", "secret123", "  newbie ")
        .await
        .unwrap();
    let session = signed_up.session.expect("in-memory gateway returns a token");
    assert_eq!(manager.current(), Some(session));

    let profile = platform
        .profile_store
        .get_profile(&signed_up.identity.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.username, "newbie");
    assert_eq!(profile.status, Presence::Online);
}

#[tokio::test]
async fn sign_up_keeps_identity_when_profile_write_fails() {
    let platform = TestPlatform::new();
    platform.profiles.fail_insert.store(true, Ordering::SeqCst);
    let manager = SessionManager::new(platform.platform.clone(), "avatars");

    let err = manager
        .sign_up("new@example.com", "secret123", "newbie")
        .await
        .unwrap_err();
    let identity = match err {
        SessionError::ProfileCreation { identity, .. } => identity,
        other => panic!("unexpected error: {other}"),
    };
    let identities = platform.identity.admin_list_users().await.unwrap();
    assert!(identities.iter().any(|existing| existing.id == identity.id));
    assert!(manager.current().is_none());
}

#[tokio::test]
async fn sign_up_requires_a_username() {
    let platform = TestPlatform::new();
    let manager = SessionManager::new(platform.platform.clone(), "avatars");
    assert!(matches!(
        manager.sign_up("new@example.com", "secret123", "   ").await,
        Err(SessionError::Invalid(_))
    ));
    assert!(platform.identity.admin_list_users().await.unwrap().is_empty());
}

#[tokio::test]
async fn restore_rejects_stale_tokens() {
    let platform = TestPlatform::new();
    let (id, token) = platform
        .register("me@example.com", "me", Presence::Offline)
        .await;
    let manager = SessionManager::new(platform.platform.clone(), "avatars");

    let session = manager.restore(&token).await.unwrap();
    assert_eq!(session.user_id(), id);
    assert!(manager.revalidate().await);

    platform.identity.sign_out(&token).await.unwrap();
    assert!(!manager.revalidate().await);
    assert!(manager.current().is_none());

    assert!(manager.restore(&token).await.is_err());
    assert!(manager.restore("garbage").await.is_err());
    assert!(manager.current().is_none());
}

#[tokio::test]
async fn profile_updates_require_a_session_and_a_username() {
    let platform = TestPlatform::new();
    let (id, _) = platform
        .register("me@example.com", "me", Presence::Offline)
        .await;
    let manager = SessionManager::new(platform.platform.clone(), "avatars");

    let rename = ProfileUpdate {
        username: Some("renamed".into()),
        avatar_url: None,
    };
    assert!(matches!(
        manager.update_profile(rename.clone()).await,
        Err(SessionError::NotSignedIn)
    ));

    manager.sign_in("me@example.com", "secret123").await.unwrap();
    let blank = ProfileUpdate {
        username: Some(" ".into()),
        avatar_url: None,
    };
    assert!(matches!(
        manager.update_profile(blank).await,
        Err(SessionError::Invalid(_))
    ));

    manager.update_profile(rename).await.unwrap();
    let profile = platform
        .profile_store
        .get_profile(&id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.username, "renamed");
}

#[tokio::test]
async fn avatar_upload_validates_and_returns_public_url() {
    let platform = TestPlatform::new();
    let (id, _) = platform
        .register("me@example.com", "me", Presence::Offline)
        .await;
    let manager = SessionManager::new(platform.platform.clone(), "avatars");
    manager.sign_in("me@example.com", "secret123").await.unwrap();

    let err = manager
        .upload_avatar("me.png", Vec::new(), "image/png")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Please select an image");

    let err = manager
        .upload_avatar("me.png", vec![0; MAX_AVATAR_BYTES + 1], "image/png")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Image size must be less than 5MB");

    let url = manager
        .upload_avatar("Me.PNG", vec![1, 2, 3], "image/png")
        .await
        .unwrap();
    let prefix = format!("memory://storage/object/public/avatars/avatars/{}-", id);
    assert!(url.starts_with(&prefix), "{url}");
    assert!(url.ends_with(".png"));

    let path = url
        .strip_prefix("memory://storage/object/public/avatars/")
        .unwrap();
    let (bytes, content_type) = platform.blobs.object("avatars", path).await.unwrap();
    assert_eq!(bytes, vec![1, 2, 3]);
    assert_eq!(content_type, "image/png");
}
