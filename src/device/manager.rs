//! Collection of active speakers sharing one engine

use super::RaopDevice;
use crate::audio::{OutputBuffer, OutputSink, Reformatter};
use crate::discovery::{DiscoveryError, ServiceBrowser};
use crate::engine::{OutputObserver, RaopEngine};
use crate::error::RaopCastError;
use crate::options::{DeviceEvent, OptionsStore};
use crate::player::{PasswordPrompt, StatusSink};
use crate::protocol::rtsp::{
    AudioJackStatus, STATUS_NOT_ENOUGH_BANDWIDTH, STATUS_OK, STATUS_UNAUTHORIZED,
};
use crate::types::{DeviceAddr, DeviceInfo, OutputFormat, OutputInterval, OutputMetadata};
use std::collections::BTreeMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Minimum spacing between "no speakers selected" alerts.
const ALERT_THROTTLE: Duration = Duration::from_secs(5);

/// TCP connect deadline for speaker sessions.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the name -> device map, drives session negotiation including the
/// password retry loop, and fans volume/metadata/progress out to every open
/// speaker. Observes the options bus for activation changes.
pub struct DeviceManager {
    engine: Arc<RaopEngine>,
    options: Arc<OptionsStore>,
    password_prompt: Arc<dyn PasswordPrompt>,
    status: Arc<dyn StatusSink>,
    browser: Option<ServiceBrowser>,
    devices: Mutex<BTreeMap<String, Arc<Mutex<RaopDevice>>>>,
    /// Master volume; `None` until the host sets one
    volume: Mutex<Option<f32>>,
    metadata: Mutex<OutputMetadata>,
    interval: Mutex<OutputInterval>,
    last_alert: Mutex<Option<Instant>>,
    observer_token: Mutex<Option<u64>>,
    user_agent: String,
    dacp_id: u64,
}

impl DeviceManager {
    /// Create a manager around a fresh engine.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` when the engine cannot start.
    pub fn new(
        options: Arc<OptionsStore>,
        output_observer: Arc<dyn OutputObserver>,
        password_prompt: Arc<dyn PasswordPrompt>,
        status: Arc<dyn StatusSink>,
        browser: Option<ServiceBrowser>,
        user_agent: impl Into<String>,
        dacp_id: u64,
    ) -> Result<Arc<Self>, RaopCastError> {
        let engine = RaopEngine::new(output_observer)?;

        let manager = Arc::new(Self {
            engine,
            options: Arc::clone(&options),
            password_prompt,
            status,
            browser,
            devices: Mutex::new(BTreeMap::new()),
            volume: Mutex::new(None),
            metadata: Mutex::new(OutputMetadata::default()),
            interval: Mutex::new((0, 0)),
            last_alert: Mutex::new(None),
            observer_token: Mutex::new(None),
            user_agent: user_agent.into(),
            dacp_id,
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        let token = options.add_observer(move |event| {
            if let Some(manager) = weak.upgrade() {
                manager.on_device_event(event);
            }
        });
        *manager.observer_token.lock().expect("manager lock poisoned") = Some(token);

        Ok(manager)
    }

    /// The engine's canonical stream format.
    #[must_use]
    pub fn output_format(&self) -> OutputFormat {
        RaopEngine::output_format()
    }

    /// The shared engine.
    #[must_use]
    pub fn engine(&self) -> Arc<RaopEngine> {
        Arc::clone(&self.engine)
    }

    /// The options store this manager observes.
    #[must_use]
    pub fn options(&self) -> Arc<OptionsStore> {
        Arc::clone(&self.options)
    }

    /// Build the producer-facing pipeline for the player's stream format:
    /// staging buffer, plus a reformatter when `format` is not canonical.
    /// A reset travelling down the pipeline flushes every open speaker
    /// before the engine rewinds.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` when the reformatter cannot be built.
    pub fn build_pipeline(self: &Arc<Self>, format: OutputFormat) -> Result<OutputBuffer, RaopCastError> {
        let engine_sink: Arc<dyn OutputSink> = Arc::new(ManagedSink {
            manager: Arc::downgrade(self),
            engine: self.engine(),
        });

        let sink: Arc<dyn OutputSink> = if format == self.output_format() {
            engine_sink
        } else {
            Arc::new(Reformatter::new(format, self.output_format(), engine_sink)?)
        };

        Ok(OutputBuffer::new(sink))
    }

    /// Ask every open speaker to drop its buffered audio (RTSP FLUSH).
    pub fn flush_open_devices(&self) {
        let devices = self.devices.lock().expect("manager lock poisoned");
        for device in devices.values() {
            let mut device = device.lock().expect("device lock poisoned");
            if device.is_open(false) {
                if let Err(e) = device.flush() {
                    warn!(error = %e, "device flush failed");
                }
            }
        }
    }

    /// Open every activated device. With none activated, raise the
    /// throttled "no speakers selected" status.
    pub fn open_devices(&self) {
        let options = self.options.options();
        let mut any_activated = false;

        for info in options.devices.values() {
            if options.is_activated(&info.name) {
                any_activated = true;
                self.open_device(info);
            }
        }

        if !any_activated {
            let mut last = self.last_alert.lock().expect("manager lock poisoned");
            if last.map_or(true, |t| t.elapsed() >= ALERT_THROTTLE) {
                *last = Some(Instant::now());
                self.status.no_devices_selected();
            }
        }
    }

    /// Close every device session.
    pub fn close_devices(&self) {
        let devices = self.devices.lock().expect("manager lock poisoned");
        for device in devices.values() {
            device.lock().expect("device lock poisoned").close();
        }
    }

    /// Whether any device has a live session. With `ping`, the TCP links
    /// are probed too.
    #[must_use]
    pub fn is_any_device_open(&self, ping: bool) -> bool {
        let devices = self.devices.lock().expect("manager lock poisoned");
        devices
            .values()
            .any(|device| device.lock().expect("device lock poisoned").is_open(ping))
    }

    /// Find the device with a DACP remote-control id.
    #[must_use]
    pub fn lookup_device(&self, remote_control_id: u32) -> Option<Arc<Mutex<RaopDevice>>> {
        if remote_control_id == 0 {
            return None;
        }
        let devices = self.devices.lock().expect("manager lock poisoned");
        devices
            .values()
            .find(|device| {
                device
                    .lock()
                    .expect("device lock poisoned")
                    .remote_control_id()
                    == remote_control_id
            })
            .cloned()
    }

    /// Set the master volume and fan the change out to every open device.
    /// A no-op while the volume-control option is off.
    pub fn set_volume(&self, level: f32) {
        if !self.options.options().volume_control {
            return;
        }
        let delta = {
            let mut volume = self.volume.lock().expect("manager lock poisoned");
            let delta = volume.map_or(0.0, |previous| level - previous);
            *volume = Some(level);
            delta
        };

        let devices = self.devices.lock().expect("manager lock poisoned");
        for device in devices.values() {
            let mut device = device.lock().expect("device lock poisoned");
            if device.is_open(false) {
                if let Err(e) = device.set_volume(level, delta) {
                    warn!(error = %e, "volume fanout failed");
                }
            }
        }
    }

    /// Recompute the track interval from a new play offset and broadcast
    /// progress.
    pub fn set_offset(&self, offset_ms: i64) {
        let length_ms = i64::from(self.metadata.lock().expect("manager lock poisoned").length_ms);
        let interval = self.engine.output_interval(length_ms, offset_ms);
        *self.interval.lock().expect("manager lock poisoned") = interval;

        let devices = self.devices.lock().expect("manager lock poisoned");
        for device in devices.values() {
            let mut device = device.lock().expect("device lock poisoned");
            if device.is_open(false) {
                if let Err(e) = device.update_progress(&interval) {
                    warn!(error = %e, "progress broadcast failed");
                }
            }
        }
    }

    /// Store new track metadata and broadcast it.
    pub fn set_metadata(&self, metadata: OutputMetadata) {
        *self.metadata.lock().expect("manager lock poisoned") = metadata.clone();

        let devices = self.devices.lock().expect("manager lock poisoned");
        for device in devices.values() {
            let mut device = device.lock().expect("device lock poisoned");
            if device.is_open(false) {
                if let Err(e) = device.update_metadata(&metadata) {
                    warn!(error = %e, "metadata broadcast failed");
                }
            }
        }
    }

    /// Forget the current track metadata and interval.
    pub fn clear_metadata(&self) {
        *self.metadata.lock().expect("manager lock poisoned") = OutputMetadata::default();
        *self.interval.lock().expect("manager lock poisoned") = (0, 0);
    }

    /// Stop the engine and drop every device.
    pub fn shutdown(&self) {
        if let Some(token) = self
            .observer_token
            .lock()
            .expect("manager lock poisoned")
            .take()
        {
            self.options.remove_observer(token);
        }
        self.close_devices();
        self.devices.lock().expect("manager lock poisoned").clear();
        self.engine.shutdown();
    }

    /// Resolve a device address and open a TCP connection to its RTSP port.
    fn connect(&self, info: &DeviceInfo) -> Result<TcpStream, RaopCastError> {
        let (host, port) = match &info.addr {
            DeviceAddr::Service { name, ty } => {
                let browser = self.browser.as_ref().ok_or_else(|| {
                    DiscoveryError::DaemonUnavailable("no service browser".into())
                })?;
                let resolved = browser.resolve(name, ty, Duration::from_secs(5))?;
                (resolved.host.to_string(), resolved.port)
            }
            DeviceAddr::Host { host, port } => (host.clone(), *port),
        };

        let mut last_error = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no addresses for {host}"),
        );
        for addr in (host.as_str(), port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = e,
            }
        }
        Err(last_error.into())
    }

    /// Run `attempt` with the device, retrying while the speaker answers
    /// 401: fetch the stored password or prompt for one, remember it when
    /// asked, and clear it again when rejected.
    fn with_password_retry<F>(
        &self,
        info: &DeviceInfo,
        device: &Arc<Mutex<RaopDevice>>,
        mut attempt: F,
    ) -> Result<i32, RaopCastError>
    where
        F: FnMut(&mut RaopDevice) -> Result<i32, RaopCastError>,
    {
        let mut code = attempt(&mut device.lock().expect("device lock poisoned"))?;

        while code == STATUS_UNAUTHORIZED {
            let stored = self.options.options().password(&info.name);
            let password = if stored.is_empty() {
                let Some(reply) = self.password_prompt.request_password(&info.name) else {
                    return Err(RaopCastError::NoPasswordEntered);
                };
                self.options
                    .set_password(&info.name, &reply.secret, reply.remember);
                reply.secret
            } else {
                stored
            };

            {
                let mut device = device.lock().expect("device lock poisoned");
                device.set_password(password);
                code = attempt(&mut device)?;
            }

            if code == STATUS_UNAUTHORIZED {
                self.options.clear_password(&info.name);
            }
        }

        Ok(code)
    }

    /// Open one device: test phase (with password loop), then session
    /// negotiation (again with password loop), volume seeding, and
    /// metadata/progress push. Failure deactivates the device.
    pub fn open_device(&self, info: &DeviceInfo) {
        if let Err(e) = self.try_open_device(info) {
            warn!(device = %info.name, error = %e, "open failed");
            self.options.deactivate(info);
        }
    }

    fn try_open_device(&self, info: &DeviceInfo) -> Result<(), RaopCastError> {
        let device = {
            let mut devices = self.devices.lock().expect("manager lock poisoned");
            if !devices.contains_key(&info.name) {
                let created = Arc::new(Mutex::new(RaopDevice::new(
                    self.engine(),
                    info.device_type,
                    self.user_agent.clone(),
                    self.dacp_id,
                )));

                // probe the speaker before the first use of a new device
                let stream = self.connect(info)?;
                created
                    .lock()
                    .expect("device lock poisoned")
                    .attach_connection(stream)?;

                let mut first_time = true;
                let code = self.with_password_retry(info, &created, |device| {
                    let result = device.test(first_time);
                    first_time = false;
                    result
                })?;

                created.lock().expect("device lock poisoned").close();

                if code != STATUS_OK {
                    self.status.device_failed(&info.name, code);
                    return Err(RaopCastError::SessionRefused(code));
                }

                devices.insert(info.name.clone(), created);
            }
            Arc::clone(devices.get(&info.name).expect("inserted above"))
        };

        let already_open = device
            .lock()
            .expect("device lock poisoned")
            .is_open(true);

        if !already_open {
            if !self.is_any_device_open(false) {
                // first device of the session initializes the shared state
                let mut interval = self.interval.lock().expect("manager lock poisoned");
                self.engine.reinit(&mut interval)?;
            }

            let stream = self.connect(info)?;
            device
                .lock()
                .expect("device lock poisoned")
                .attach_connection(stream)?;

            let mut jack = AudioJackStatus::Connected;
            let code = self.with_password_retry(info, &device, |device| {
                let (code, jack_status) = device.open()?;
                jack = jack_status;
                Ok(code)
            })?;

            if code != STATUS_OK {
                if code == STATUS_NOT_ENOUGH_BANDWIDTH {
                    self.status.device_in_use(&info.name);
                } else {
                    self.status.device_failed(&info.name, code);
                }
                return Err(RaopCastError::SessionRefused(code));
            }

            if jack == AudioJackStatus::Disconnected {
                self.status.jack_disconnected(&info.name);
            }

            {
                let mut device = device.lock().expect("device lock poisoned");

                // AV receivers publish a hardware volume; seed from it
                if info.device_type == crate::types::DeviceType::Avr {
                    if let Err(e) = device.get_volume() {
                        debug!(error = %e, "volume pull failed");
                    }
                }
                if let Some(level) = *self.volume.lock().expect("manager lock poisoned") {
                    device.set_volume(level, 0.0)?;
                }

                let metadata = self.metadata.lock().expect("manager lock poisoned").clone();
                if !metadata.is_empty() {
                    let interval = *self.interval.lock().expect("manager lock poisoned");
                    device.update_metadata(&metadata)?;
                    device.update_progress(&interval)?;
                }
            }
        } else {
            let metadata = self.metadata.lock().expect("manager lock poisoned").clone();
            if metadata.length_ms > 0 {
                let interval = *self.interval.lock().expect("manager lock poisoned");
                device
                    .lock()
                    .expect("device lock poisoned")
                    .update_progress(&interval)?;
            }
        }

        Ok(())
    }

    /// Close and forget one device.
    fn destroy_device(&self, name: &str) {
        let removed = self
            .devices
            .lock()
            .expect("manager lock poisoned")
            .remove(name);
        if let Some(device) = removed {
            device.lock().expect("device lock poisoned").close();
        }
    }

    fn on_device_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Activated(info) => {
                // join the running session immediately; otherwise the next
                // playback start will pick the device up
                if self.is_any_device_open(false) {
                    self.open_device(info);
                }
            }
            DeviceEvent::Deactivated(info) => {
                self.destroy_device(&info.name);
            }
            DeviceEvent::Created(_) | DeviceEvent::Destroyed(_) => {}
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Engine sink that gives the manager a say in stream resets: open devices
/// flush their playback buffers over RTSP before the engine rewinds.
struct ManagedSink {
    manager: Weak<DeviceManager>,
    engine: Arc<RaopEngine>,
}

impl OutputSink for ManagedSink {
    fn latency(&self, format: &OutputFormat) -> Result<i64, RaopCastError> {
        self.engine.latency(format)
    }

    fn buffered(&self) -> usize {
        OutputSink::buffered(&self.engine)
    }

    fn can_write(&self) -> usize {
        OutputSink::can_write(&self.engine)
    }

    fn write(&self, buffer: &[u8]) -> Result<(), RaopCastError> {
        OutputSink::write(&self.engine, buffer)
    }

    fn flush(&self) -> Result<(), RaopCastError> {
        OutputSink::flush(&self.engine)
    }

    fn reset(&self) -> Result<(), RaopCastError> {
        // stop the stream first so flushed speakers receive nothing stale
        self.engine.stop();
        if let Some(manager) = self.manager.upgrade() {
            manager.flush_open_devices();
        }
        OutputSink::reset(&self.engine)
    }
}
