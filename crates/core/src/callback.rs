// Player events and listener registration
// Events are collected while the engine lock is held and delivered after it is released

use crate::error::ErrorCode;
use crate::state::{InternalState, PublicState, StopReason};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Caller-supplied identity of a queued item. Not required to be unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueItemId(String);

impl QueueItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for QueueItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for QueueItemId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Player event types
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Public state changed
    StateChanged { old: PublicState, new: PublicState },

    /// Internal state changed (diagnostics)
    InternalStateChanged { old: InternalState, new: InternalState },

    /// An item became the currently playing item
    ItemStarted { id: QueueItemId },

    /// All data of an item has been read from its source
    ItemFinishedBuffering { id: QueueItemId },

    /// An item stopped playing
    ItemFinishedPlaying {
        id: QueueItemId,
        reason: StopReason,
        progress: f64,
        duration: f64,
    },

    /// Items removed from the queue without being played, in queue order
    ItemsCancelled { ids: Vec<QueueItemId> },

    /// Unrecoverable error; the player has entered the error state
    Error { code: ErrorCode },

    /// Playback became active or inactive
    PlaybackActivityChanged { active: bool },

    /// Metadata found inline in an item's stream
    Metadata {
        id: QueueItemId,
        frame: u64,
        tags: Vec<(String, String)>,
    },
}

/// Player listener trait
///
/// Called from engine threads with no engine lock held, so a listener may call back into
/// the player. Implementations should return quickly.
pub trait PlayerListener: Send + Sync {
    /// Entry point for every event. The default routes to the typed methods below.
    fn on_event(&self, event: &PlayerEvent) {
        match event {
            PlayerEvent::StateChanged { old, new } => self.state_changed(*new, *old),
            PlayerEvent::InternalStateChanged { old, new } => {
                self.internal_state_changed(*new, *old)
            }
            PlayerEvent::ItemStarted { id } => self.item_started(id),
            PlayerEvent::ItemFinishedBuffering { id } => self.item_finished_buffering(id),
            PlayerEvent::ItemFinishedPlaying {
                id,
                reason,
                progress,
                duration,
            } => self.item_finished_playing(id, *reason, *progress, *duration),
            PlayerEvent::ItemsCancelled { ids } => self.items_cancelled(ids),
            PlayerEvent::Error { code } => self.error(*code),
            PlayerEvent::PlaybackActivityChanged { active } => {
                self.playback_activity_changed(*active)
            }
            PlayerEvent::Metadata { id, frame, tags } => self.metadata(id, *frame, tags),
        }
    }

    fn state_changed(&self, _new: PublicState, _old: PublicState) {}

    fn error(&self, _code: ErrorCode) {}

    fn item_started(&self, _id: &QueueItemId) {}

    fn item_finished_buffering(&self, _id: &QueueItemId) {}

    fn item_finished_playing(
        &self,
        _id: &QueueItemId,
        _reason: StopReason,
        _progress: f64,
        _duration: f64,
    ) {
    }

    fn items_cancelled(&self, _ids: &[QueueItemId]) {}

    fn internal_state_changed(&self, _new: InternalState, _old: InternalState) {}

    fn playback_activity_changed(&self, _active: bool) {}

    fn metadata(&self, _id: &QueueItemId, _frame: u64, _tags: &[(String, String)]) {}
}

struct Registration {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Arc<dyn PlayerListener>,
}

struct Registry {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Registry {
    fn remove(&self, id: u64) {
        self.listeners.lock().retain(|reg| reg.id != id);
    }
}

/// Handle returned by [`EventDispatcher::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Stop delivering events to the listener
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Delivers events to registered listeners
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn PlayerListener>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(!self.is_closed()));

        if !self.is_closed() {
            self.registry.listeners.lock().push(Registration {
                id,
                active: active.clone(),
                listener,
            });
        }

        Subscription {
            id,
            active,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.listeners.lock().len()
    }

    /// Deliver events in order. Must not be called with the engine lock held.
    pub fn dispatch(&self, events: Vec<PlayerEvent>) {
        if events.is_empty() {
            return;
        }

        // Snapshot so listeners can subscribe or unsubscribe from inside a callback
        let snapshot: Vec<(Arc<AtomicBool>, Arc<dyn PlayerListener>)> = self
            .registry
            .listeners
            .lock()
            .iter()
            .map(|reg| (reg.active.clone(), reg.listener.clone()))
            .collect();

        for event in &events {
            log::trace!("[events] {:?}", event);
            for (active, listener) in &snapshot {
                if active.load(Ordering::Acquire) {
                    listener.on_event(event);
                }
            }
        }
    }

    /// Drop every listener. Later subscriptions are inert.
    pub fn close(&self) {
        self.registry.closed.store(true, Ordering::Release);
        let mut listeners = self.registry.listeners.lock();
        for reg in listeners.iter() {
            reg.active.store(false, Ordering::Release);
        }
        listeners.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.registry.closed.load(Ordering::Acquire)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
