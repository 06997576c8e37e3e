//! Process-wide configuration snapshots and the device notification bus
//!
//! Readers hold an `Arc` to an immutable [`Options`] snapshot; writers build
//! a replacement and publish it through [`OptionsStore::set_options`], which
//! diffs the two snapshots and emits one [`DeviceEvent`] sequence per
//! changed device. Delivery is synchronous on the publishing thread.

use crate::types::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

/// One lifecycle change of a device record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device record appeared.
    Created(DeviceInfo),
    /// Device was selected for output.
    Activated(DeviceInfo),
    /// Device was removed from the output set.
    Deactivated(DeviceInfo),
    /// Device record disappeared.
    Destroyed(DeviceInfo),
}

impl DeviceEvent {
    /// The device the event concerns.
    #[must_use]
    pub fn device(&self) -> &DeviceInfo {
        match self {
            Self::Created(d) | Self::Activated(d) | Self::Deactivated(d) | Self::Destroyed(d) => d,
        }
    }
}

/// Stored password entry: the secret and whether to persist it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordEntry {
    /// The shared secret
    pub secret: String,
    /// Persist across runs
    pub remember: bool,
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Options {
    /// Mirror the player's volume changes to the speakers.
    pub volume_control: bool,
    /// Let speakers drive the player through DACP.
    pub player_control: bool,
    /// Reset the stream (drop buffered audio) when playback pauses.
    pub reset_on_pause: bool,
    /// Known devices, keyed by name.
    pub devices: BTreeMap<String, DeviceInfo>,
    /// Names currently selected for output.
    pub activated: BTreeSet<String>,
    /// Device passwords.
    pub passwords: BTreeMap<String, PasswordEntry>,
}

impl Options {
    /// Whether `name` is selected for output.
    #[must_use]
    pub fn is_activated(&self, name: &str) -> bool {
        self.activated.contains(name)
    }

    /// Stored password for `name`, empty when absent.
    #[must_use]
    pub fn password(&self, name: &str) -> String {
        self.passwords
            .get(name)
            .map(|p| p.secret.clone())
            .unwrap_or_default()
    }
}

type Observer = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Holder of the current snapshot plus the observer registry.
pub struct OptionsStore {
    current: RwLock<Arc<Options>>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer_id: Mutex<u64>,
}

impl Default for OptionsStore {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl OptionsStore {
    /// Create a store with an initial snapshot. No events are emitted for
    /// the initial contents.
    #[must_use]
    pub fn new(initial: Options) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            observers: Mutex::new(Vec::new()),
            next_observer_id: Mutex::new(0),
        }
    }

    /// The current snapshot. The returned `Arc` stays valid after later
    /// publications.
    #[must_use]
    pub fn options(&self) -> Arc<Options> {
        Arc::clone(&self.current.read().expect("options lock poisoned"))
    }

    /// Register an observer; returns a token for [`Self::remove_observer`].
    pub fn add_observer<F>(&self, observer: F) -> u64
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        let mut next = self.next_observer_id.lock().expect("options lock poisoned");
        let id = *next;
        *next += 1;
        self.observers
            .lock()
            .expect("options lock poisoned")
            .push((id, Arc::new(observer)));
        id
    }

    /// Remove a previously registered observer.
    pub fn remove_observer(&self, id: u64) {
        self.observers
            .lock()
            .expect("options lock poisoned")
            .retain(|(observer_id, _)| *observer_id != id);
    }

    /// Deliver an event to every observer, on the calling thread. The
    /// registry lock is released before delivery so observers may publish
    /// follow-up events.
    pub fn post(&self, event: &DeviceEvent) {
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .expect("options lock poisoned")
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(event);
        }
    }

    /// Publish a new snapshot and emit the diff:
    ///
    /// * present in old, absent in new: `Deactivated` (if it was activated)
    ///   then `Destroyed`
    /// * present in both with the activation flag flipped: `Activated` or
    ///   `Deactivated`
    /// * new name: `Created`, then `Activated` if selected
    pub fn set_options(&self, new_options: Options) {
        let new_options = Arc::new(new_options);

        let old_options = {
            let mut current = self.current.write().expect("options lock poisoned");
            std::mem::replace(&mut *current, Arc::clone(&new_options))
        };

        for (name, old_info) in &old_options.devices {
            match new_options.devices.get(name) {
                Some(new_info) => {
                    let was = old_options.is_activated(name);
                    let is = new_options.is_activated(name);
                    if !was && is {
                        self.post(&DeviceEvent::Activated(new_info.clone()));
                    } else if was && !is {
                        self.post(&DeviceEvent::Deactivated(new_info.clone()));
                    }
                }
                None => {
                    if old_options.is_activated(name) {
                        self.post(&DeviceEvent::Deactivated(old_info.clone()));
                    }
                    self.post(&DeviceEvent::Destroyed(old_info.clone()));
                }
            }
        }

        for (name, new_info) in &new_options.devices {
            if !old_options.devices.contains_key(name) {
                self.post(&DeviceEvent::Created(new_info.clone()));
                if new_options.is_activated(name) {
                    self.post(&DeviceEvent::Activated(new_info.clone()));
                }
            }
        }
    }

    /// Convenience: deactivate one device in place and emit the event.
    pub fn deactivate(&self, info: &DeviceInfo) {
        {
            let mut current = self.current.write().expect("options lock poisoned");
            if current.activated.contains(&info.name) {
                let mut updated = (**current).clone();
                updated.activated.remove(&info.name);
                *current = Arc::new(updated);
            } else {
                return;
            }
        }
        self.post(&DeviceEvent::Deactivated(info.clone()));
    }

    /// Convenience: store a password without emitting events.
    pub fn set_password(&self, name: &str, secret: &str, remember: bool) {
        let mut current = self.current.write().expect("options lock poisoned");
        let mut updated = (**current).clone();
        updated.passwords.insert(
            name.to_string(),
            PasswordEntry {
                secret: secret.to_string(),
                remember,
            },
        );
        *current = Arc::new(updated);
    }

    /// Convenience: forget a rejected password.
    pub fn clear_password(&self, name: &str) {
        let mut current = self.current.write().expect("options lock poisoned");
        let mut updated = (**current).clone();
        updated.passwords.remove(name);
        *current = Arc::new(updated);
    }
}
