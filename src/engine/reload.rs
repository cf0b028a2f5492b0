//! Live reload.
//!
//! Stages and watch reactions push [`Signal`]s through a cloneable
//! [`Reloader`]. A [`Hub`] thread receives them and broadcasts each one to
//! every connected browser over a WebSocket. The client set is locked for the
//! whole broadcast, so every listener sees the same update for a change.

use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use camino::Utf8Path;
use serde::Serialize;
use tungstenite::WebSocket;

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Connections kept open at once; older tabs are closed first.
const MAX_CLIENTS: usize = 10;

/// Message sent to connected browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Signal {
    /// Swap the listed stylesheets in place.
    Inject { paths: Vec<String> },
    /// Reload the whole page.
    Reload,
}

/// Sending half of the live-reload channel.
///
/// Sending never blocks. When nothing listens anymore the signal is dropped.
#[derive(Debug, Clone)]
pub struct Reloader {
    tx: Option<Sender<Signal>>,
    inject_changes: bool,
}

impl Reloader {
    /// Creates a reloader and the receiver its signals arrive on.
    ///
    /// With `inject_changes` disabled, injections are sent as full reloads.
    pub fn channel(inject_changes: bool) -> (Self, Receiver<Signal>) {
        let (tx, rx) = channel();
        (
            Self {
                tx: Some(tx),
                inject_changes,
            },
            rx,
        )
    }

    /// A reloader that discards every signal.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            inject_changes: false,
        }
    }

    /// Requests in-place injection of freshly written files.
    pub fn inject<'a>(&self, files: impl IntoIterator<Item = &'a Utf8Path>) {
        let paths: Vec<_> = files.into_iter().map(url_path).collect();

        if paths.is_empty() {
            return;
        }

        if self.inject_changes {
            self.send(Signal::Inject { paths });
        } else {
            self.send(Signal::Reload);
        }
    }

    /// Requests a full page reload.
    pub fn reload(&self) {
        self.send(Signal::Reload);
    }

    fn send(&self, signal: Signal) {
        if let Some(tx) = &self.tx {
            tracing::debug!(?signal, "live reload");
            tx.send(signal).ok();
        }
    }
}

/// Turns an output path into the URL path a browser would request.
pub(crate) fn url_path(path: &Utf8Path) -> String {
    let relative = std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(&cwd).ok())
        .unwrap_or(path);

    let mut url = String::from("/");
    for component in relative.components() {
        match component {
            camino::Utf8Component::Normal(part) => {
                if !url.ends_with('/') {
                    url.push('/');
                }
                url.push_str(part);
            }
            camino::Utf8Component::ParentDir => {
                if let Some(index) = url.trim_end_matches('/').rfind('/') {
                    url.truncate(index + 1);
                }
            }
            _ => {}
        }
    }

    url
}

/// Broadcasts reload signals to connected browsers.
pub struct Hub {
    clients: Clients,
    _thread: JoinHandle<()>,
}

impl Hub {
    /// Starts broadcasting the signals received on `signals`.
    pub fn start(signals: Receiver<Signal>) -> Self {
        let clients: Clients = Arc::default();
        let thread = new_thread_ws_reload(signals, clients.clone());

        Self {
            clients,
            _thread: thread,
        }
    }

    /// Accepts browser connections on `port`, falling back to any free port
    /// when it is taken. Returns the bound port.
    pub fn listen(&self, port: u16) -> std::io::Result<u16> {
        let (listener, port) = reserve_port(port)?;
        new_thread_ws_incoming(listener, self.clients.clone());
        Ok(port)
    }

    #[cfg(test)]
    fn connected(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

fn reserve_port(port: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0")?,
    };

    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("live reload connection failed: {e}");
                    continue;
                }
            };

            match tungstenite::accept(stream) {
                Ok(socket) => clients.lock().unwrap().push(socket),
                Err(e) => tracing::warn!("live reload handshake failed: {e}"),
            }
        }
    })
}

fn new_thread_ws_reload(signals: Receiver<Signal>, clients: Clients) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(signal) = signals.recv() {
            let message = match serde_json::to_string(&signal) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!("couldn't encode live reload signal: {e}");
                    continue;
                }
            };

            let mut clients = clients.lock().unwrap();
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send(message.as_str().into()) {
                    Ok(_) => {}
                    Err(tungstenite::error::Error::Io(e)) => {
                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            broken.push(i);
                        }
                    }
                    Err(tungstenite::error::Error::ConnectionClosed)
                    | Err(tungstenite::error::Error::AlreadyClosed) => broken.push(i),
                    Err(e) => {
                        tracing::error!("live reload error: {e:?}");
                    }
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            let len = clients.len();
            if len > MAX_CLIENTS {
                for mut socket in clients.drain(0..len - MAX_CLIENTS) {
                    socket.close(None).ok();
                }
            }
        }
    })
}

/// Browser side of the live reload channel.
pub(crate) fn client_script(port: u16) -> String {
    format!(
        r#"
(() => {{
    const socket = new WebSocket(`ws://${{location.hostname}}:{port}`);
    socket.addEventListener("message", (event) => {{
        const signal = JSON.parse(event.data);
        if (signal.kind !== "inject") {{
            location.reload();
            return;
        }}
        const stamp = Date.now();
        for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {{
            const url = new URL(link.href, location.href);
            if (signal.paths.some((path) => url.pathname.endsWith(path))) {{
                url.searchParams.set("nagare", stamp);
                link.href = url.toString();
            }}
        }}
    }});
}})();
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_are_tagged_json() {
        let inject = Signal::Inject {
            paths: vec!["/assets/css/main.css".into()],
        };

        assert_eq!(
            serde_json::to_string(&inject).unwrap(),
            r#"{"kind":"inject","paths":["/assets/css/main.css"]}"#
        );
        assert_eq!(
            serde_json::to_string(&Signal::Reload).unwrap(),
            r#"{"kind":"reload"}"#
        );
    }

    #[test]
    fn inject_degrades_to_reload() {
        let (reload, rx) = Reloader::channel(false);
        reload.inject([Utf8Path::new("assets/css/main.css")]);
        assert_eq!(rx.try_recv().unwrap(), Signal::Reload);
    }

    #[test]
    fn inject_without_files_sends_nothing() {
        let (reload, rx) = Reloader::channel(true);
        reload.inject(std::iter::empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_reloader_drops_signals() {
        Reloader::disabled().reload();
    }

    #[test]
    fn url_paths() {
        assert_eq!(url_path(Utf8Path::new("./assets/css/main.css")), "/assets/css/main.css");
        assert_eq!(url_path(Utf8Path::new("build/../css/a.css")), "/css/a.css");
        assert_eq!(url_path(Utf8Path::new("main.css")), "/main.css");
    }

    #[test]
    fn broadcast_reaches_no_one_without_clients() {
        let (reload, rx) = Reloader::channel(true);
        let hub = Hub::start(rx);
        reload.reload();
        assert_eq!(hub.connected(), 0);
    }
}
