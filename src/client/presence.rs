// 位置上报与在线状态同步
//
// 后台任务独占位置缓存，视图只能通过 watch 读取快照或通过 broadcast 接收增量。

use std::future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};

use super::Session;
use crate::config::Config;
use crate::platform::{
    BoxFuture, ChangeEvent, ChangeFeed, ChangeFilter, Location, Platform, ProfileStore,
    Subscription, UserLocation,
};
use crate::utils::best_effort;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);
pub const GEOLOCATION_UNSUPPORTED: &str = "Geolocation is not supported by your browser";
pub const LOCATION_WRITE_FAILED: &str = "Failed to update location";

const DIFF_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct GeoError(pub String);

/// 设备定位能力
pub trait LocationSource: Send + Sync {
    fn current_position(&self) -> BoxFuture<'_, Result<Location, GeoError>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationState {
    pub own_location: Option<Location>,
    pub others: Vec<UserLocation>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocationDiff {
    Seeded(Vec<UserLocation>),
    Replaced(UserLocation),
    Added(UserLocation),
    OwnLocation(Location),
    Error(String),
}

impl LocationState {
    /// 应用一条资料 UPDATE：已缓存则替换，否则（且不是自己）追加
    ///
    /// 不比较时间先后，后到的事件覆盖先到的。
    pub fn apply_update(&mut self, self_id: &str, update: UserLocation) -> Option<LocationDiff> {
        if let Some(entry) = self.others.iter_mut().find(|entry| entry.id == update.id) {
            *entry = update.clone();
            return Some(LocationDiff::Replaced(update));
        }
        if update.id == self_id {
            return None;
        }
        self.others.push(update.clone());
        Some(LocationDiff::Added(update))
    }
}

pub struct PresenceSync {
    profiles: Arc<dyn ProfileStore>,
    changes: Arc<dyn ChangeFeed>,
    geolocation: Option<Arc<dyn LocationSource>>,
    interval: Duration,
}

impl PresenceSync {
    /// `geolocation` 为 None 表示设备不支持定位
    pub fn new(platform: &Platform, geolocation: Option<Arc<dyn LocationSource>>) -> Self {
        Self {
            profiles: platform.profiles.clone(),
            changes: platform.changes.clone(),
            geolocation,
            interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    /// 采样间隔取自 `LOCATION_INTERVAL_SECS`
    pub fn from_config(
        platform: &Platform,
        config: &Config,
        geolocation: Option<Arc<dyn LocationSource>>,
    ) -> Self {
        Self::new(platform, geolocation).with_interval(config.location_interval())
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn start(&self, session: &Session) -> PresenceHandle {
        let initial = LocationState {
            loading: self.geolocation.is_some(),
            error: self
                .geolocation
                .is_none()
                .then(|| GEOLOCATION_UNSUPPORTED.to_string()),
            ..LocationState::default()
        };
        if self.geolocation.is_none() {
            tracing::warn!("No location source, location will not be published");
        }

        let (state_tx, state_rx) = watch::channel(initial);
        let (diffs, _) = broadcast::channel(DIFF_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor = PresenceActor {
            user_id: session.user_id().to_string(),
            profiles: self.profiles.clone(),
            changes: self.changes.clone(),
            geolocation: self.geolocation.clone(),
            interval: self.interval,
            state: state_tx,
            diffs: diffs.clone(),
        };
        let task = tokio::spawn(actor.run(shutdown_rx));

        PresenceHandle {
            state: state_rx,
            diffs,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// 持有者被 drop 时同步任务也会退出
pub struct PresenceHandle {
    state: watch::Receiver<LocationState>,
    diffs: broadcast::Sender<LocationDiff>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PresenceHandle {
    pub fn state(&self) -> watch::Receiver<LocationState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> LocationState {
        self.state.borrow().clone()
    }

    pub fn diffs(&self) -> broadcast::Receiver<LocationDiff> {
        self.diffs.subscribe()
    }

    /// 停止定时采样并取消订阅，返回后不会再有任何写入
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Presence sync task failed: {}", e);
        }
    }
}

struct PresenceActor {
    user_id: String,
    profiles: Arc<dyn ProfileStore>,
    changes: Arc<dyn ChangeFeed>,
    geolocation: Option<Arc<dyn LocationSource>>,
    interval: Duration,
    state: watch::Sender<LocationState>,
    diffs: broadcast::Sender<LocationDiff>,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => future::pending().await,
    }
}

impl PresenceActor {
    // shutdown 的发送端被 drop 时 changed() 立即返回错误，同样视为退出
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // 先订阅再拉取，避免漏掉拉取期间的更新
        let subscribed = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            result = self.changes.subscribe(ChangeFilter::ProfileUpdates) => result,
        };
        let mut subscription = match subscribed {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::error!("Failed to subscribe to profile changes: {}", e);
                None
            }
        };

        let seeded = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            result = self.profiles.list_locations_excluding(&self.user_id) => result,
        };
        match seeded {
            Ok(others) => {
                tracing::debug!("Seeded {} user locations", others.len());
                self.state.send_modify(|state| state.others = others.clone());
                self.emit(LocationDiff::Seeded(others));
            }
            Err(e) => tracing::error!("Error fetching user locations: {}", e),
        }

        // 第一次 tick 立即触发
        let mut ticker = self.geolocation.as_ref().map(|_| {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = next_tick(&mut ticker) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = self.sample() => {}
                    }
                }
                event = next_event(&mut subscription) => match event {
                    Some(ChangeEvent::ProfileUpdated(profile)) => self.apply(profile.into()),
                    Some(_) => {}
                    None => {
                        tracing::warn!("Profile change subscription closed");
                        subscription = None;
                    }
                },
            }
        }
        tracing::debug!("Presence sync for {} stopped", self.user_id);
    }

    fn emit(&self, diff: LocationDiff) {
        // 没有视图在监听时丢弃
        let _ = self.diffs.send(diff);
    }

    fn apply(&self, update: UserLocation) {
        let mut diff = None;
        self.state.send_if_modified(|state| {
            diff = state.apply_update(&self.user_id, update);
            diff.is_some()
        });
        if let Some(diff) = diff {
            self.emit(diff);
        }
    }

    fn fail(&self, message: String) {
        self.state.send_modify(|state| {
            state.error = Some(message.clone());
            state.loading = false;
        });
        self.emit(LocationDiff::Error(message));
    }

    async fn sample(&self) {
        let Some(geolocation) = &self.geolocation else {
            return;
        };

        match geolocation.current_position().await {
            Ok(location) => {
                self.state.send_modify(|state| {
                    state.own_location = Some(location);
                    state.loading = false;
                });
                self.emit(LocationDiff::OwnLocation(location));

                let written = best_effort(
                    "update_location",
                    self.profiles
                        .update_location(&self.user_id, location, Utc::now()),
                )
                .await;
                if written.is_none() {
                    self.fail(LOCATION_WRITE_FAILED.to_string());
                }
            }
            Err(e) => self.fail(format!("Error getting location: {}", e)),
        }
    }
}
