//! 浏览器端逻辑：会话、位置同步和私信，全部直接访问平台而不经过 HTTP 服务

pub mod chat;
pub mod presence;
pub mod session;

pub use chat::{ChatError, Conversation, ConversationState, DirectMessages};
pub use presence::{
    GeoError, LocationDiff, LocationSource, LocationState, PresenceHandle, PresenceSync,
};
pub use session::{Session, SessionError, SessionManager, SignUp};
