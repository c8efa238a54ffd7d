//! The bot's presence: `/status` text and status, and going idle after a
//! quiet spell.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serenity::gateway::{ActivityData, ShardMessenger};
use serenity::model::user::OnlineStatus;
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

/// Discord caps custom statuses at this many characters.
pub const STATUS_CHARACTER_LIMIT: usize = 128;

/// Where presence updates go. Implemented by the gateway shard.
pub trait PresenceTarget: Send + Sync {
    fn apply(&self, status: OnlineStatus, activity: Option<&str>);
}

impl PresenceTarget for ShardMessenger {
    fn apply(&self, status: OnlineStatus, activity: Option<&str>) {
        self.set_presence(activity.map(ActivityData::custom), status);
    }
}

struct PresenceState {
    status: OnlineStatus,
    activity: Option<String>,
    target: Option<Arc<dyn PresenceTarget>>,
}

pub struct PresenceManager {
    idle_timeout: Duration,
    state: Mutex<PresenceState>,
    changed: Notify,
}

impl PresenceManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            state: Mutex::new(PresenceState {
                status: OnlineStatus::Online,
                activity: None,
                target: None,
            }),
            changed: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> OnlineStatus {
        self.state().status
    }

    pub fn activity(&self) -> Option<String> {
        self.state().activity.clone()
    }

    /// Connects (or reconnects) to the gateway and re-applies the presence.
    pub fn attach(&self, target: Arc<dyn PresenceTarget>) {
        let mut state = self.state();
        target.apply(state.status, state.activity.as_deref());
        state.target = Some(target);
        drop(state);
        self.changed.notify_one();
    }

    fn set_status(&self, status: OnlineStatus) {
        let mut state = self.state();
        if state.status == status {
            return;
        }
        debug!("Presence status is now {:?}", status);
        state.status = status;
        if let Some(target) = &state.target {
            target.apply(state.status, state.activity.as_deref());
        }
    }

    /// What `/status` does. No text and no status clears the custom
    /// status; text over the limit leaves the current one alone.
    pub fn set(&self, text: Option<&str>, status: Option<OnlineStatus>) {
        let mut state = self.state();
        state.status = status.unwrap_or(OnlineStatus::Online);
        match text.map(str::trim) {
            Some(text) if text.chars().count() <= STATUS_CHARACTER_LIMIT => {
                state.activity = Some(text.to_string());
            }
            Some(text) => warn!(
                "Status exceeds maximum status length ({} characters) by {} character(s). \
                 Leaving current status alone.",
                STATUS_CHARACTER_LIMIT,
                text.chars().count() - STATUS_CHARACTER_LIMIT
            ),
            None if status.is_none() => state.activity = None,
            None => {}
        }
        if let Some(target) = &state.target {
            target.apply(state.status, state.activity.as_deref());
        }
        drop(state);
        self.changed.notify_one();
    }

    /// Turns idle once nothing has been answered for the idle timeout, and
    /// back online as soon as a response starts. Only an online bot goes
    /// idle; a status picked with `/status` is left alone.
    pub async fn run(self: Arc<Self>, mut busy: watch::Receiver<usize>) {
        if self.idle_timeout.is_zero() {
            return;
        }
        loop {
            let responding = *busy.borrow_and_update() > 0;
            if responding && self.status() == OnlineStatus::Idle {
                self.set_status(OnlineStatus::Online);
            }
            let countdown = !responding && self.status() == OnlineStatus::Online;

            tokio::select! {
                changed = busy.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(self.idle_timeout), if countdown => {
                    self.set_status(OnlineStatus::Idle);
                }
            }
        }
    }
}

/// Parses the `/status` presence choice.
pub fn parse_status(name: &str) -> Option<OnlineStatus> {
    match name.trim().to_ascii_lowercase().as_str() {
        "online" => Some(OnlineStatus::Online),
        "idle" => Some(OnlineStatus::Idle),
        "do not disturb" | "dnd" => Some(OnlineStatus::DoNotDisturb),
        "invisible" => Some(OnlineStatus::Invisible),
        _ => None,
    }
}
