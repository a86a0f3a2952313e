use std::fmt::Display;
use std::future::Future;

/// 尽力而为的写入：失败只记录日志，不向上返回
///
/// 用于在线状态、已读标记、位置上报这类写入；管理接口和登录必须返回错误，不走这里。
pub async fn best_effort<T, E, F>(operation: &'static str, write: F) -> Option<T>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match write.await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(operation, "Best-effort write failed: {}", e);
            None
        }
    }
}
