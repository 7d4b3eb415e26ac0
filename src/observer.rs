//! Observer registration and fan-out for catalog change notifications.

use std::sync::Arc;

use crate::camera::Camera;
use crate::error::{Error, Result};
use crate::registry::Interface;
use crate::sync::ReaderWriterLock;

/// Why a catalog changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateTrigger {
    /// An entity appeared.
    PluggedIn,
    /// An entity disappeared.
    PluggedOut,
    /// An existing entity changed state (for example reachability).
    StateChanged,
}

/// Receives camera catalog changes.
pub trait CameraListObserver: Send + Sync {
    /// `camera` was plugged in, plugged out or changed state.
    fn camera_list_changed(&self, camera: &Arc<Camera>, trigger: UpdateTrigger);
}

/// Receives interface catalog changes.
pub trait InterfaceListObserver: Send + Sync {
    /// `interface` was plugged in, plugged out or changed state.
    fn interface_list_changed(&self, interface: &Arc<Interface>, trigger: UpdateTrigger);
}

impl<F> CameraListObserver for F
where
    F: Fn(&Arc<Camera>, UpdateTrigger) + Send + Sync,
{
    fn camera_list_changed(&self, camera: &Arc<Camera>, trigger: UpdateTrigger) {
        self(camera, trigger);
    }
}

impl<F> InterfaceListObserver for F
where
    F: Fn(&Arc<Interface>, UpdateTrigger) + Send + Sync,
{
    fn interface_list_changed(&self, interface: &Arc<Interface>, trigger: UpdateTrigger) {
        self(interface, trigger);
    }
}

/// An ordered list of observers compared by identity.
///
/// Notification takes a snapshot under the read lock and calls observers
/// after releasing it, so an observer may register or unregister from
/// inside its own callback.
pub struct ObserverList<T: ?Sized> {
    entries: ReaderWriterLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> ObserverList<T> {
    /// Create an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: ReaderWriterLock::new("observer list", Vec::new()),
        }
    }

    /// Add `observer`.
    ///
    /// `on_first` runs when the list goes from empty to one entry; if it
    /// fails the registration is rolled back and its error returned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCall` if `observer` is already registered.
    pub fn register<F>(&self, observer: Arc<T>, on_first: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut entries = self.entries.enter_write_exclusive()?;
        if entries.iter().any(|entry| Arc::ptr_eq(entry, &observer)) {
            return Err(Error::InvalidCall("observer already registered".to_owned()));
        }
        entries.push(observer);
        if entries.len() == 1 {
            if let Err(err) = on_first() {
                entries.clear();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Remove `observer`.
    ///
    /// `on_last` runs when the list becomes empty. Its failure is reported
    /// but the observer stays removed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `observer` is not registered.
    pub fn unregister<F>(&self, observer: &Arc<T>, on_last: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut entries = self.entries.enter_write_exclusive()?;
        let position = entries
            .iter()
            .position(|entry| Arc::ptr_eq(entry, observer))
            .ok_or_else(|| Error::NotFound("observer".to_owned()))?;
        entries.remove(position);
        if entries.is_empty() {
            on_last()?;
        }
        Ok(())
    }

    /// Call `notify` for every registered observer in registration order.
    pub fn notify<F>(&self, mut notify: F) -> Result<()>
    where
        F: FnMut(&T),
    {
        let snapshot = self.entries.enter_read()?.clone();
        for observer in &snapshot {
            notify(observer);
        }
        Ok(())
    }

    /// Remove every observer without running any hook.
    pub fn clear(&self) -> Result<()> {
        self.entries.enter_write_exclusive()?.clear();
        Ok(())
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.entries.enter_read().map_or(0, |entries| entries.len())
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
