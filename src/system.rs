//! The registry root: catalogs of transport layers, interfaces and cameras,
//! hot-plug handling and catalog observers.
//!
//! A [`System`] is constructed explicitly with [`System::startup`] and owns
//! the driver session and the dispatch thread until [`System::shutdown`]
//! (or drop). Catalog lookups that miss refresh the catalog from the driver
//! and try again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, error, info, warn};

use crate::camera::Camera;
use crate::config::SystemConfig;
use crate::dispatch::{DiscoveryHandler, Dispatcher};
use crate::driver::{
    AccessMode, CameraInfo, DeviceHandle, DiscoveryKind, DiscoveryTarget, Driver,
    InterfaceHandle, TransportLayerHandle,
};
use crate::error::{Error, Result};
use crate::observer::{CameraListObserver, InterfaceListObserver, ObserverList, UpdateTrigger};
use crate::registry::{reconcile, Interface, TransportLayer};
use crate::sync::ReaderWriterLock;

/// Entry point: owns the driver session and the entity catalogs.
pub struct System {
    driver: Arc<dyn Driver>,
    config: SystemConfig,
    dispatcher: Dispatcher,
    running: AtomicBool,
    transport_layers: ReaderWriterLock<Vec<Arc<TransportLayer>>>,
    interfaces: ReaderWriterLock<BTreeMap<InterfaceHandle, Arc<Interface>>>,
    cameras: ReaderWriterLock<BTreeMap<String, Arc<Camera>>>,
    camera_observers: ObserverList<dyn CameraListObserver>,
    interface_observers: ObserverList<dyn InterfaceListObserver>,
}

impl System {
    /// Start the driver and load the transport layers.
    ///
    /// # Arguments
    ///
    /// * `driver` - The transport driver to run on
    /// * `config` - Dispatch and acquisition settings
    ///
    /// # Errors
    ///
    /// Returns the driver's error if it fails to start or to list its
    /// transport layers; nothing is left running in that case.
    pub fn startup(driver: Arc<dyn Driver>, config: SystemConfig) -> Result<Arc<Self>> {
        let system = Arc::new(Self {
            driver,
            dispatcher: Dispatcher::new(config.dispatch_capacity()),
            config,
            running: AtomicBool::new(false),
            transport_layers: ReaderWriterLock::new("transport layers", Vec::new()),
            interfaces: ReaderWriterLock::new("interfaces", BTreeMap::new()),
            cameras: ReaderWriterLock::new("cameras", BTreeMap::new()),
            camera_observers: ObserverList::new(),
            interface_observers: ObserverList::new(),
        });

        let handler: Weak<dyn DiscoveryHandler> = Arc::downgrade(&system) as Weak<dyn DiscoveryHandler>;
        system.dispatcher.start(handler)?;

        if let Err(err) = system.driver.startup(system.dispatcher.sink()) {
            system.dispatcher.stop();
            return Err(err);
        }

        let transport_layers = match system.driver.transport_layers() {
            Ok(transport_layers) => transport_layers,
            Err(err) => {
                system.driver.shutdown();
                system.dispatcher.stop();
                return Err(err);
            }
        };
        *system.transport_layers.enter_write()? = transport_layers
            .into_iter()
            .map(|info| Arc::new(TransportLayer::new(info)))
            .collect();

        system.running.store(true, Ordering::Release);
        info!(
            transport_layers = system.transport_layers.enter_read()?.len(),
            "system started"
        );
        Ok(system)
    }

    /// Release everything: observers, open cameras, catalogs, the driver
    /// session and the dispatch thread. Calling it again does nothing.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let had_camera_observers = !self.camera_observers.is_empty();
        let had_interface_observers = !self.interface_observers.is_empty();
        for result in [self.camera_observers.clear(), self.interface_observers.clear()] {
            if let Err(err) = result {
                warn!(%err, "could not clear observers");
            }
        }
        for (enabled, target) in [
            (had_camera_observers, DiscoveryTarget::Cameras),
            (had_interface_observers, DiscoveryTarget::Interfaces),
        ] {
            if enabled {
                if let Err(err) = self.driver.disable_discovery(target) {
                    debug!(%err, ?target, "could not disable discovery");
                }
            }
        }

        let cameras: Vec<Arc<Camera>> = match self.cameras.enter_write_exclusive() {
            Ok(mut cameras) => std::mem::take(&mut *cameras).into_values().collect(),
            Err(err) => {
                warn!(%err, "could not clear camera catalog");
                Vec::new()
            }
        };
        for camera in cameras.iter().filter(|camera| camera.is_open()) {
            if let Err(err) = camera.close() {
                warn!(camera = camera.id(), %err, "could not close camera");
            }
        }
        if let Ok(mut interfaces) = self.interfaces.enter_write_exclusive() {
            interfaces.clear();
        }
        if let Ok(mut transport_layers) = self.transport_layers.enter_write() {
            transport_layers.clear();
        }

        self.driver.shutdown();
        self.dispatcher.stop();
        info!("system shut down");
    }

    /// Returns `true` between startup and shutdown.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Configuration the system was started with.
    pub const fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// All transport layers.
    pub fn transport_layers(&self) -> Result<Vec<Arc<TransportLayer>>> {
        self.ensure_running()?;
        Ok(self.transport_layers.enter_read()?.clone())
    }

    /// Transport layer with the given id.
    pub fn transport_layer_by_id(&self, id: &str) -> Result<Arc<TransportLayer>> {
        self.transport_layers()?
            .into_iter()
            .find(|transport_layer| transport_layer.id() == id)
            .ok_or_else(|| Error::NotFound(format!("transport layer {id}")))
    }

    /// Transport layer owning `interface`.
    ///
    /// # Errors
    ///
    /// Returns `TlNotFound` if the transport layer is gone.
    pub fn transport_layer_of(&self, interface: &Interface) -> Result<Arc<TransportLayer>> {
        self.find_transport_layer(interface.transport_layer_handle())?
            .ok_or_else(|| Error::TlNotFound(format!("transport layer of interface {}", interface.id())))
    }

    /// All interfaces, after refreshing the catalog.
    pub fn interfaces(&self) -> Result<Vec<Arc<Interface>>> {
        self.refresh_interfaces()?;
        Ok(self.interfaces.enter_read()?.values().cloned().collect())
    }

    /// Interface with the given id. Refreshes the catalog on a miss.
    pub fn interface_by_id(&self, id: &str) -> Result<Arc<Interface>> {
        self.lookup_interface(|interface| interface.id() == id)?
            .ok_or_else(|| Error::NotFound(format!("interface {id}")))
    }

    /// Interface with the given handle. Refreshes the catalog on a miss.
    pub fn interface_by_handle(&self, handle: InterfaceHandle) -> Result<Arc<Interface>> {
        self.lookup_interface(|interface| interface.handle() == handle)?
            .ok_or_else(|| Error::NotFound(format!("interface {handle}")))
    }

    /// Interface `camera` is attached to.
    pub fn interface_of(&self, camera: &Camera) -> Result<Arc<Interface>> {
        self.interface_by_handle(camera.interface_handle())
    }

    /// Interfaces belonging to `transport_layer`.
    pub fn interfaces_by_transport_layer(
        &self,
        transport_layer: &TransportLayer,
    ) -> Result<Vec<Arc<Interface>>> {
        Ok(self
            .interfaces()?
            .into_iter()
            .filter(|interface| interface.transport_layer_handle() == transport_layer.handle())
            .collect())
    }

    /// All cameras, after refreshing the catalog.
    pub fn cameras(&self) -> Result<Vec<Arc<Camera>>> {
        self.refresh_cameras()?;
        Ok(self.cameras.enter_read()?.values().cloned().collect())
    }

    /// Cameras reached through `transport_layer`.
    pub fn cameras_by_transport_layer(
        &self,
        transport_layer: &TransportLayer,
    ) -> Result<Vec<Arc<Camera>>> {
        Ok(self
            .cameras()?
            .into_iter()
            .filter(|camera| camera.transport_layer_handle() == transport_layer.handle())
            .collect())
    }

    /// Cameras attached to `interface`.
    pub fn cameras_by_interface(&self, interface: &Interface) -> Result<Vec<Arc<Camera>>> {
        Ok(self
            .cameras()?
            .into_iter()
            .filter(|camera| camera.interface_handle() == interface.handle())
            .collect())
    }

    /// Camera by extended id, plain id or any alias the driver resolves
    /// (for example an IP address).
    ///
    /// A camera the driver knows but the catalog does not yet hold is
    /// added to the catalog.
    pub fn camera_by_id(&self, id: &str) -> Result<Arc<Camera>> {
        self.ensure_running()?;
        if id.is_empty() {
            return Err(Error::BadParameter("camera id is empty".to_owned()));
        }
        if let Some(camera) = self.find_camera(id)? {
            return Ok(camera);
        }

        let info = self.driver.camera_info(id)?;
        if let Some(camera) = self.find_camera(&info.extended_id)? {
            return Ok(camera);
        }
        self.insert_camera(info)
    }

    /// Camera whose open device has the given handle.
    pub fn camera_by_handle(&self, device: DeviceHandle) -> Result<Arc<Camera>> {
        self.ensure_running()?;
        self.cameras
            .enter_read()?
            .values()
            .find(|camera| camera.device_handle().is_ok_and(|handle| handle == device))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("camera with device {device}")))
    }

    /// Look up a camera and open it.
    pub fn open_camera_by_id(&self, id: &str, mode: AccessMode) -> Result<Arc<Camera>> {
        let camera = self.camera_by_id(id)?;
        camera.open(mode)?;
        Ok(camera)
    }

    /// Bring the interface catalog in line with the driver.
    ///
    /// # Errors
    ///
    /// Returns `TlNotFound` if an interface belongs to an unknown transport
    /// layer; the rest of the catalog is still updated.
    pub fn refresh_interfaces(&self) -> Result<()> {
        self.ensure_running()?;
        let transport_layers = self.transport_layer_handles()?;

        // List under the lock so refreshes and hot-plug updates apply in order.
        let mut interfaces = self.interfaces.enter_write_exclusive()?;
        let listed = self.driver.interfaces()?;
        let reconciled = reconcile(
            &mut interfaces,
            listed,
            |info| info.handle,
            |info| {
                if transport_layers.contains(&info.transport_layer) {
                    Ok(Interface::new(info))
                } else {
                    Err(Error::TlNotFound(format!(
                        "transport layer {} of interface {}",
                        info.transport_layer, info.id
                    )))
                }
            },
        );
        drop(interfaces);

        debug!(
            added = reconciled.added.len(),
            removed = reconciled.removed.len(),
            "interface catalog refreshed"
        );
        reconciled.outcome.into_result()
    }

    /// Bring the camera catalog in line with the driver.
    ///
    /// Cameras whose interface or transport layer is unknown are skipped
    /// and logged. Cameras still present keep their identity.
    pub fn refresh_cameras(&self) -> Result<()> {
        self.ensure_running()?;
        let transport_layers = self.transport_layer_handles()?;
        let mut interfaces = self.interface_handles()?;

        // List under the lock so refreshes and hot-plug updates apply in order.
        let mut cameras = self.cameras.enter_write_exclusive()?;
        let mut listed = self.driver.cameras()?;
        if listed.iter().any(|info| !interfaces.contains(&info.interface)) {
            // The interface lock is never taken while the camera lock is held.
            drop(cameras);
            if let Err(err) = self.refresh_interfaces() {
                debug!(%err, "interface refresh reported a problem");
            }
            interfaces = self.interface_handles()?;
            cameras = self.cameras.enter_write_exclusive()?;
            listed = self.driver.cameras()?;
        }
        let reconciled = reconcile(
            &mut cameras,
            listed,
            |info| info.extended_id.clone(),
            |info| self.build_camera(info, &transport_layers, &interfaces),
        );
        drop(cameras);

        if let Some(err) = &reconciled.outcome.first_error {
            warn!(%err, "some cameras were left out of the catalog");
        }
        debug!(
            added = reconciled.added.len(),
            removed = reconciled.removed.len(),
            "camera catalog refreshed"
        );
        Ok(())
    }

    /// Register an observer for camera arrival, departure and state changes.
    ///
    /// The first observer primes the camera catalog and enables camera
    /// discovery in the driver; if either fails the registration is undone.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCall` if `observer` is already registered.
    pub fn register_camera_list_observer(&self, observer: Arc<dyn CameraListObserver>) -> Result<()> {
        self.ensure_running()?;
        self.camera_observers.register(observer, || {
            self.refresh_cameras()?;
            self.driver.enable_discovery(DiscoveryTarget::Cameras)
        })
    }

    /// Remove a camera list observer. The last one disables camera discovery.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `observer` is not registered.
    pub fn unregister_camera_list_observer(&self, observer: &Arc<dyn CameraListObserver>) -> Result<()> {
        self.camera_observers.unregister(observer, || {
            self.driver.disable_discovery(DiscoveryTarget::Cameras)
        })
    }

    /// Register an observer for interface arrival and departure.
    ///
    /// The first observer primes the interface catalog and enables
    /// interface discovery in the driver.
    pub fn register_interface_list_observer(
        &self,
        observer: Arc<dyn InterfaceListObserver>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.interface_observers.register(observer, || {
            self.refresh_interfaces()?;
            self.driver.enable_discovery(DiscoveryTarget::Interfaces)
        })
    }

    /// Remove an interface list observer. The last one disables interface discovery.
    pub fn unregister_interface_list_observer(
        &self,
        observer: &Arc<dyn InterfaceListObserver>,
    ) -> Result<()> {
        self.interface_observers.unregister(observer, || {
            self.driver.disable_discovery(DiscoveryTarget::Interfaces)
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::InvalidCall("system is not running".to_owned()))
        }
    }

    fn transport_layer_handles(&self) -> Result<BTreeSet<TransportLayerHandle>> {
        Ok(self
            .transport_layers
            .enter_read()?
            .iter()
            .map(|transport_layer| transport_layer.handle())
            .collect())
    }

    fn interface_handles(&self) -> Result<BTreeSet<InterfaceHandle>> {
        Ok(self.interfaces.enter_read()?.keys().copied().collect())
    }

    fn find_transport_layer(&self, handle: TransportLayerHandle) -> Result<Option<Arc<TransportLayer>>> {
        Ok(self
            .transport_layers
            .enter_read()?
            .iter()
            .find(|transport_layer| transport_layer.handle() == handle)
            .cloned())
    }

    fn find_interface<P: Fn(&Interface) -> bool>(&self, matches: P) -> Result<Option<Arc<Interface>>> {
        Ok(self
            .interfaces
            .enter_read()?
            .values()
            .find(|interface| matches(interface))
            .cloned())
    }

    fn lookup_interface<P: Fn(&Interface) -> bool>(&self, matches: P) -> Result<Option<Arc<Interface>>> {
        self.ensure_running()?;
        if let Some(interface) = self.find_interface(&matches)? {
            return Ok(Some(interface));
        }
        if let Err(err) = self.refresh_interfaces() {
            debug!(%err, "interface refresh reported a problem");
        }
        self.find_interface(&matches)
    }

    fn find_camera(&self, id: &str) -> Result<Option<Arc<Camera>>> {
        let cameras = self.cameras.enter_read()?;
        Ok(cameras
            .get(id)
            .or_else(|| cameras.values().find(|camera| camera.id() == id))
            .cloned())
    }

    /// Refresh interfaces first if a listed camera sits on one not yet known.
    fn ensure_interfaces_for(&self, listed: &[CameraInfo]) {
        let Ok(known) = self.interface_handles() else {
            return;
        };
        if listed.iter().any(|info| !known.contains(&info.interface)) {
            if let Err(err) = self.refresh_interfaces() {
                debug!(%err, "interface refresh reported a problem");
            }
        }
    }

    fn build_camera(
        &self,
        info: CameraInfo,
        transport_layers: &BTreeSet<TransportLayerHandle>,
        interfaces: &BTreeSet<InterfaceHandle>,
    ) -> Result<Camera> {
        if !transport_layers.contains(&info.transport_layer) {
            return Err(Error::TlNotFound(format!(
                "transport layer {} of camera {}",
                info.transport_layer, info.id
            )));
        }
        if !interfaces.contains(&info.interface) {
            return Err(Error::NotFound(format!(
                "interface {} of camera {}",
                info.interface, info.id
            )));
        }
        Ok(Camera::new(info, Arc::clone(&self.driver)))
    }

    fn insert_camera(&self, info: CameraInfo) -> Result<Arc<Camera>> {
        self.ensure_interfaces_for(std::slice::from_ref(&info));
        let transport_layers = self.transport_layer_handles()?;
        let interfaces = self.interface_handles()?;

        let mut cameras = self.cameras.enter_write_exclusive()?;
        if let Some(existing) = cameras.get(&info.extended_id) {
            return Ok(Arc::clone(existing));
        }
        // Query again under the lock: the camera may have departed meanwhile.
        let info = self.driver.camera_info(&info.extended_id)?;
        let key = info.extended_id.clone();
        let camera = Arc::new(self.build_camera(info, &transport_layers, &interfaces)?);
        cameras.insert(key, Arc::clone(&camera));
        Ok(camera)
    }

    fn remove_camera(&self, id: &str) -> Result<Option<Arc<Camera>>> {
        let mut cameras = self.cameras.enter_write_exclusive()?;
        let key = if cameras.contains_key(id) {
            Some(id.to_owned())
        } else {
            cameras
                .iter()
                .find(|(_, camera)| camera.id() == id)
                .map(|(key, _)| key.clone())
        };
        Ok(key.and_then(|key| cameras.remove(&key)))
    }

    fn notify_cameras(&self, camera: &Arc<Camera>, trigger: UpdateTrigger) {
        if let Err(err) = self
            .camera_observers
            .notify(|observer| observer.camera_list_changed(camera, trigger))
        {
            warn!(%err, "could not notify camera observers");
        }
    }

    fn notify_interfaces(&self, interface: &Arc<Interface>, trigger: UpdateTrigger) {
        if let Err(err) = self
            .interface_observers
            .notify(|observer| observer.interface_list_changed(interface, trigger))
        {
            warn!(%err, "could not notify interface observers");
        }
    }
}

impl DiscoveryHandler for System {
    fn camera_event(&self, camera_id: &str, kind: DiscoveryKind) {
        if !self.is_running() {
            return;
        }
        let (camera, trigger) = match kind {
            DiscoveryKind::Missing => (self.remove_camera(camera_id), UpdateTrigger::PluggedOut),
            DiscoveryKind::Detected => (self.camera_by_id(camera_id).map(Some), UpdateTrigger::PluggedIn),
            DiscoveryKind::Reachable | DiscoveryKind::Unreachable => {
                (self.camera_by_id(camera_id).map(Some), UpdateTrigger::StateChanged)
            }
        };
        match camera {
            Ok(Some(camera)) => {
                debug!(camera = camera.id(), ?trigger, "camera list changed");
                self.notify_cameras(&camera, trigger);
            }
            Ok(None) => debug!(camera = camera_id, "departed camera was not in the catalog"),
            Err(err) => warn!(camera = camera_id, ?kind, %err, "could not resolve camera event"),
        }
    }

    fn interface_event(&self, interface_id: &str) {
        if !self.is_running() {
            return;
        }
        let before = self.find_interface(|interface| interface.id() == interface_id);
        if let Err(err) = self.refresh_interfaces() {
            debug!(%err, "interface refresh reported a problem");
        }
        let after = self.find_interface(|interface| interface.id() == interface_id);

        match (before, after) {
            (Ok(None), Ok(Some(interface))) => self.notify_interfaces(&interface, UpdateTrigger::PluggedIn),
            (Ok(Some(interface)), Ok(None)) => self.notify_interfaces(&interface, UpdateTrigger::PluggedOut),
            (Ok(Some(_)), Ok(Some(interface))) => {
                self.notify_interfaces(&interface, UpdateTrigger::StateChanged);
            }
            (Ok(None), Ok(None)) => {
                error!(interface = interface_id, "interface event for an interface that was never listed");
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(interface = interface_id, %err, "could not resolve interface event");
            }
        }
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("running", &self.is_running())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
