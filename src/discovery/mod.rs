//! mDNS service discovery and device inventory scanning

pub mod classifier;

pub use classifier::{classify, ClassifyError, TxtRecord};

use crate::types::{DeviceAddr, DeviceInfo};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Service type for RAOP speakers.
pub const RAOP_SERVICE_TYPE: &str = "_raop._tcp.local.";
/// Service type for the DACP remote control listener.
pub const DACP_SERVICE_TYPE: &str = "_dacp._tcp.local.";

/// Discovery errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The mDNS daemon could not be created or has shut down.
    #[error("mdns daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// A browse/register operation failed.
    #[error("mdns operation failed: {0}")]
    OperationFailed(String),

    /// A service name did not resolve in time.
    #[error("service did not resolve: {0}")]
    ResolveTimeout(String),
}

/// A resolved DNS-SD service instance.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    /// Full service name (`instance._type.local.`)
    pub fullname: String,
    /// Resolved host address
    pub host: std::net::IpAddr,
    /// Service port
    pub port: u16,
    /// TXT record contents
    pub txt: TxtRecord,
}

/// Construct `instance._type.local.` per DNS-SD naming.
#[must_use]
pub fn full_name(instance: &str, service_type: &str) -> String {
    let ty = service_type.trim_end_matches('.');
    let ty = ty.strip_suffix(".local").unwrap_or(ty);
    format!("{instance}.{ty}.local.")
}

/// Wrapper around the mDNS daemon. One instance per process; cloneable
/// handles share the daemon's reactor.
#[derive(Clone)]
pub struct ServiceBrowser {
    daemon: ServiceDaemon,
}

impl ServiceBrowser {
    /// Start (or connect to) the mDNS daemon.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::DaemonUnavailable` when the daemon cannot
    /// bind its multicast socket.
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonUnavailable(e.to_string()))?;
        Ok(Self { daemon })
    }

    /// Probe the daemon: true when it still answers its command channel.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.daemon.get_metrics().is_ok()
    }

    /// Begin browsing `service_type`; events arrive on the returned channel.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::OperationFailed` if the browse cannot start.
    pub fn browse(
        &self,
        service_type: &str,
    ) -> Result<mdns_sd::Receiver<ServiceEvent>, DiscoveryError> {
        self.daemon
            .browse(service_type)
            .map_err(|e| DiscoveryError::OperationFailed(e.to_string()))
    }

    /// Stop a browse started with [`Self::browse`].
    pub fn stop_browse(&self, service_type: &str) {
        if let Err(e) = self.daemon.stop_browse(service_type) {
            warn!(service_type, error = %e, "stop_browse failed");
        }
    }

    /// One-shot resolve of a service instance: browse the type until the
    /// instance resolves or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::ResolveTimeout` when nothing resolves.
    pub fn resolve(
        &self,
        instance: &str,
        service_type: &str,
        timeout: Duration,
    ) -> Result<ResolvedService, DiscoveryError> {
        let wanted = full_name(instance, service_type);
        let receiver = self.browse(service_type)?;
        let deadline = std::time::Instant::now() + timeout;

        // the standing browse for the type stays active; only this
        // receiver goes away when we return
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(DiscoveryError::ResolveTimeout(wanted));
            }
            match receiver.recv_timeout(remaining) {
                Ok(ServiceEvent::ServiceResolved(info)) if info.get_fullname() == wanted => {
                    return resolved_from_info(&info)
                        .ok_or(DiscoveryError::ResolveTimeout(wanted));
                }
                Ok(_) => continue,
                Err(_) => return Err(DiscoveryError::ResolveTimeout(wanted)),
            }
        }
    }

    /// Advertise a service with a TXT record.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::OperationFailed` when registration fails.
    pub fn register(
        &self,
        instance: &str,
        service_type: &str,
        port: u16,
        txt: &TxtRecord,
    ) -> Result<String, DiscoveryError> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".into());
        let host = format!("{hostname}.local.");

        let properties: HashMap<String, String> = txt
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let info = ServiceInfo::new(service_type, instance, &host, "", port, properties)
            .map_err(|e| DiscoveryError::OperationFailed(e.to_string()))?
            .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::OperationFailed(e.to_string()))?;

        debug!(%fullname, port, "service registered");
        Ok(fullname)
    }

    /// Withdraw a service registered with [`Self::register`].
    pub fn unregister(&self, fullname: &str) {
        if let Err(e) = self.daemon.unregister(fullname) {
            warn!(fullname, error = %e, "unregister failed");
        }
    }

    /// Shut down the daemon; all outstanding browses end.
    pub fn shutdown(&self) {
        let _ = self.daemon.shutdown();
    }
}

fn resolved_from_info(info: &ServiceInfo) -> Option<ResolvedService> {
    let host = info.get_addresses().iter().next().copied()?;
    let txt: TxtRecord = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    Some(ResolvedService {
        fullname: info.get_fullname().to_string(),
        host,
        port: info.get_port(),
        txt,
    })
}

/// Inventory event emitted by the scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A speaker appeared (or re-resolved) on the network.
    Found(DeviceInfo),
    /// A speaker's advertisement went away. Carries the display name.
    Lost(String),
}

/// RAOP instance names look like `112233AABBCC@Kitchen`; the display name
/// follows the `@`.
#[must_use]
pub fn display_name(instance: &str) -> String {
    instance
        .split_once('@')
        .map_or(instance, |(_, name)| name)
        .to_string()
}

/// Background scanner browsing `_raop._tcp.` and classifying everything
/// that resolves. Events are delivered on the scanner thread.
pub struct DeviceScanner {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    browser: ServiceBrowser,
}

impl DeviceScanner {
    /// Start scanning; `on_event` receives found/lost devices.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError` when the browse cannot start.
    pub fn start<F>(browser: ServiceBrowser, on_event: F) -> Result<Self, DiscoveryError>
    where
        F: Fn(ScanEvent) + Send + 'static,
    {
        let receiver = browser.browse(RAOP_SERVICE_TYPE)?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("raop-scanner".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    match receiver.recv_timeout(Duration::from_millis(10)) {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            let Some(resolved) = resolved_from_info(&info) else {
                                continue;
                            };
                            let instance = resolved
                                .fullname
                                .strip_suffix(&format!(".{RAOP_SERVICE_TYPE}"))
                                .unwrap_or(&resolved.fullname);
                            let name = display_name(instance);

                            match classify(&resolved.txt) {
                                Ok(device_type) => {
                                    trace!(%name, ?device_type, "speaker resolved");
                                    on_event(ScanEvent::Found(DeviceInfo::new(
                                        device_type,
                                        name,
                                        DeviceAddr::Service {
                                            name: instance.to_string(),
                                            ty: RAOP_SERVICE_TYPE.to_string(),
                                        },
                                        true,
                                    )));
                                }
                                Err(e) => debug!(%name, error = %e, "speaker not usable"),
                            }
                        }
                        Ok(ServiceEvent::ServiceRemoved(_ty, fullname)) => {
                            let instance = fullname
                                .strip_suffix(&format!(".{RAOP_SERVICE_TYPE}"))
                                .unwrap_or(&fullname);
                            on_event(ScanEvent::Lost(display_name(instance)));
                        }
                        Ok(_) => {}
                        Err(_) => {} // timeout; loop to honor the stop flag
                    }
                }
            })
            .map_err(|e| DiscoveryError::OperationFailed(e.to_string()))?;

        Ok(Self {
            stop,
            thread: Some(thread),
            browser,
        })
    }

    /// Stop the scanner thread and the underlying browse.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.browser.stop_browse(RAOP_SERVICE_TYPE);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceScanner {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Fold a scan event into the device inventory: found speakers are added or
/// refreshed, lost ones removed. Manual (non-zero-conf) entries survive a
/// lost advertisement; discovered entries are ephemeral. Publishing the
/// updated snapshot emits the corresponding device events.
pub fn apply_scan_event(store: &crate::options::OptionsStore, event: &ScanEvent) {
    let current = store.options();

    match event {
        ScanEvent::Found(info) => {
            if current.devices.get(&info.name) == Some(info) {
                return; // unchanged re-announcement
            }
            let mut updated = (*current).clone();
            updated.devices.insert(info.name.clone(), info.clone());
            store.set_options(updated);
        }
        ScanEvent::Lost(name) => {
            let removable = current
                .devices
                .get(name)
                .map_or(false, |existing| existing.zero_conf);
            if !removable {
                return;
            }
            let mut updated = (*current).clone();
            updated.devices.remove(name);
            updated.activated.remove(name);
            store.set_options(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_name_forms() {
        assert_eq!(
            full_name("AABB@Den", "_raop._tcp."),
            "AABB@Den._raop._tcp.local."
        );
        assert_eq!(
            full_name("iTunes_Ctrl_0001", "_dacp._tcp.local."),
            "iTunes_Ctrl_0001._dacp._tcp.local."
        );
    }

    #[test]
    fn display_name_strips_mac_prefix() {
        assert_eq!(display_name("112233AABBCC@Kitchen"), "Kitchen");
        assert_eq!(display_name("Plain Name"), "Plain Name");
    }

    #[test]
    fn scan_events_maintain_the_inventory() {
        use crate::options::OptionsStore;
        use crate::types::DeviceType;

        let store = OptionsStore::default();
        let discovered = DeviceInfo::new(
            DeviceType::Apx,
            "Den",
            DeviceAddr::Service {
                name: "AA@Den".into(),
                ty: RAOP_SERVICE_TYPE.into(),
            },
            true,
        );

        apply_scan_event(&store, &ScanEvent::Found(discovered.clone()));
        assert!(store.options().devices.contains_key("Den"));

        // unchanged re-announcement publishes nothing new
        let before = Arc::as_ptr(&store.options());
        apply_scan_event(&store, &ScanEvent::Found(discovered));
        assert_eq!(before, Arc::as_ptr(&store.options()));

        apply_scan_event(&store, &ScanEvent::Lost("Den".into()));
        assert!(!store.options().devices.contains_key("Den"));
    }

    #[test]
    fn manual_entries_survive_lost_advertisements() {
        use crate::options::{Options, OptionsStore};
        use crate::types::DeviceType;

        let manual = DeviceInfo::new(
            DeviceType::Apx,
            "Study",
            DeviceAddr::Host {
                host: "10.0.0.9".into(),
                port: 5000,
            },
            false,
        );
        let mut initial = Options::default();
        initial.devices.insert("Study".into(), manual);
        let store = OptionsStore::new(initial);

        apply_scan_event(&store, &ScanEvent::Lost("Study".into()));
        assert!(store.options().devices.contains_key("Study"));
    }
}
