//! DACP remote-control server
//!
//! Speakers control the player by sending HTTP/1.1 GET requests to
//! `/ctrl-int/1/<command>` on this listener. The `Active-Remote` header
//! carries the per-device correlator handed out during RTSP, which routes
//! `setproperty` volume changes back to the right speaker; every other
//! command goes to the [`Player`] port.

mod commands;
mod httpdate;

pub use commands::{parse_request, DacpCommand, DacpRequest};

use crate::device::manager::DeviceManager;
use crate::discovery::{ServiceBrowser, TxtRecord, DACP_SERVICE_TYPE};
use crate::error::RaopCastError;
use crate::player::Player;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Well-known DACP port; bind probing moves upward when it is taken.
const DACP_PORT: u16 = 3689;

/// Select-loop cycle time.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Derive the process-stable DACP identifier from the user-agent string and
/// the hostname: a weak 32-bit fold of each, packed into a u64.
#[must_use]
pub fn dacp_id(user_agent: &str) -> u64 {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into());

    (u64::from(fold_hash(user_agent)) << 32) | u64::from(fold_hash(&hostname))
}

fn fold_hash(text: &str) -> u32 {
    // djb2
    text.bytes()
        .fold(5381u32, |hash, byte| {
            hash.wrapping_mul(33).wrapping_add(u32::from(byte))
        })
}

struct Client {
    stream: TcpStream,
    buffer: Vec<u8>,
}

/// The DACP HTTP listener plus its mDNS registration.
pub struct DacpServer {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    registration: Option<(ServiceBrowser, String)>,
    port: u16,
}

impl DacpServer {
    /// Bind the listener (3689 or the next free port), advertise
    /// `iTunes_Ctrl_<id>` over `_dacp._tcp.`, and start the serving thread.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` when no port can be bound.
    pub fn start(
        manager: Arc<DeviceManager>,
        player: Arc<dyn Player>,
        browser: Option<ServiceBrowser>,
        user_agent: impl Into<String>,
        dacp_id: u64,
    ) -> Result<Self, RaopCastError> {
        let user_agent = user_agent.into();
        let listener = bind_probing(DACP_PORT)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        // advertise the control listener so speakers can find it
        let registration = browser.and_then(|browser| {
            if !browser.is_available() {
                return None;
            }
            let id_hex = format!("{dacp_id:016X}");
            let mut txt = TxtRecord::new();
            txt.put("Ver", "65536");
            txt.put("DbId", id_hex.clone());

            match browser.register(
                &format!("iTunes_Ctrl_{id_hex}"),
                DACP_SERVICE_TYPE,
                port,
                &txt,
            ) {
                Ok(fullname) => Some((browser, fullname)),
                Err(e) => {
                    warn!(error = %e, "dacp service registration failed");
                    None
                }
            }
        });

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("dacp-server".into())
            .spawn(move || serve(&listener, &thread_stop, &manager, &player, &user_agent))?;

        debug!(port, "dacp server listening");
        Ok(Self {
            stop,
            thread: Some(thread),
            registration,
            port,
        })
    }

    /// The bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Withdraw the advertisement and stop the serving thread.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some((browser, fullname)) = self.registration.take() {
            browser.unregister(&fullname);
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DacpServer {
    fn drop(&mut self) {
        self.halt();
    }
}

fn bind_probing(start_port: u16) -> Result<TcpListener, RaopCastError> {
    let mut port = start_port;
    loop {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) if port == u16::MAX => return Err(e.into()),
            Err(_) => port += 1,
        }
    }
}

/// Accept loop: the listener plus one buffered socket per client, polled on
/// a 50 ms cycle, stopped cooperatively.
fn serve(
    listener: &TcpListener,
    stop: &AtomicBool,
    manager: &Arc<DeviceManager>,
    player: &Arc<dyn Player>,
    user_agent: &str,
) {
    let mut clients: Vec<Client> = Vec::new();

    while !stop.load(Ordering::SeqCst) {
        let mut idle = true;

        match listener.accept() {
            Ok((stream, peer)) => {
                idle = false;
                trace!(%peer, "dacp client connected");
                if stream.set_nonblocking(true).is_ok() {
                    clients.push(Client {
                        stream,
                        buffer: Vec::new(),
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "dacp accept failed"),
        }

        clients.retain_mut(|client| {
            match drain_client(client, manager, player, user_agent) {
                Ok(progressed) => {
                    if progressed {
                        idle = false;
                    }
                    true
                }
                Err(_) => false, // disconnect; drop the socket
            }
        });

        if idle {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Read whatever the client has, answer every complete request in the
/// buffer. `Ok(true)` when bytes moved, `Err` when the peer is gone.
fn drain_client(
    client: &mut Client,
    manager: &Arc<DeviceManager>,
    player: &Arc<dyn Player>,
    user_agent: &str,
) -> Result<bool, std::io::Error> {
    let mut chunk = [0u8; 2048];
    let mut progressed = false;
    let mut eof = false;

    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => {
                // drain buffered requests before letting the socket go
                eof = true;
                break;
            }
            Ok(n) => {
                progressed = true;
                client.buffer.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    while let Some(end) = client
        .buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
    {
        let raw: Vec<u8> = client.buffer.drain(..end).collect();
        let text = String::from_utf8_lossy(&raw);
        trace!("dacp request:\n{text}");

        let request = parse_request(&text);
        let understood = request
            .as_ref()
            .map_or(false, |r| r.command != DacpCommand::None);

        let response = build_response(understood, user_agent);
        client.stream.write_all(response.as_bytes())?;

        if let Some(request) = request {
            dispatch(&request, manager, player);
        }
        progressed = true;
    }

    if eof {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer closed",
        ));
    }
    Ok(progressed)
}

fn build_response(understood: bool, user_agent: &str) -> String {
    let status = if understood {
        "204 No Content"
    } else {
        "501 Not Implemented"
    };
    format!(
        "HTTP/1.1 {status}\r\n\
         Date: {}\r\n\
         DAAP-Server: {user_agent}\r\n\
         Content-Type: application/x-dmap-tagged\r\n\
         Content-Length: 0\r\n\r\n",
        httpdate::now()
    )
}

fn dispatch(request: &DacpRequest, manager: &Arc<DeviceManager>, player: &Arc<dyn Player>) {
    match request.command {
        DacpCommand::SetProperty => {
            let Some(volume) = request
                .params
                .get("dmcp.device-volume")
                .and_then(|v| v.parse::<f32>().ok())
            else {
                return;
            };
            let Some(device) = manager.lookup_device(request.remote_control_id) else {
                debug!(
                    id = request.remote_control_id,
                    "no device for Active-Remote id"
                );
                return;
            };
            let result = device.lock().expect("device lock poisoned").put_volume(volume);
            if let Err(e) = result {
                warn!(error = %e, "device volume change failed");
            }
        }
        DacpCommand::Play => player.play(),
        DacpCommand::Pause => player.pause(),
        DacpCommand::Stop => player.stop(),
        DacpCommand::Restart => player.restart(),
        DacpCommand::NextTrack => player.start_next(),
        DacpCommand::PrevTrack => player.start_prev(),
        DacpCommand::VolumeUp => player.increase_volume(),
        DacpCommand::VolumeDown => player.decrease_volume(),
        DacpCommand::ToggleMute => player.toggle_mute(),
        DacpCommand::ToggleShuffle => player.toggle_shuffle(),
        DacpCommand::None => {}
    }
}
