//! Development server.
//!
//! Either serves `server_root` as static files or proxies every request to
//! `project_url`. HTML responses get the live-reload client appended when a
//! reload port is known.

use std::net::{SocketAddr, TcpListener};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::map_response_with_state;
use axum::response::{IntoResponse, Response};
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

use crate::Environment;
use crate::config::Settings;
use crate::engine::reload::client_script;

const BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Runs the server until the process ends.
///
/// The port is bound on the calling thread, so a taken port fails the task
/// right away.
pub(crate) fn serve(env: &Environment, reload_port: Option<u16>) -> anyhow::Result<()> {
    let settings = &env.settings;

    let address = SocketAddr::from(([127, 0, 0, 1], settings.server_port));
    let listener = TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;

    let url = format!("http://localhost:{}/", listener.local_addr()?.port());
    let router = router(settings, reload_port.map(client_script))?;

    match &settings.server_root {
        Some(root) => info!(url = %style(&url).yellow(), %root, "serving files"),
        None => info!(url = %style(&url).yellow(), target = %settings.project_url, "proxying"),
    }

    let handle = thread::Builder::new()
        .name("http".into())
        .spawn(move || -> anyhow::Result<()> {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    axum::serve(listener, router).await?;
                    Ok(())
                })
        })?;

    if settings.browser_auto_open
        && let Err(e) = open_browser(&url)
    {
        tracing::warn!("couldn't open a browser: {e}");
    }

    handle
        .join()
        .map_err(|_| anyhow::anyhow!("HTTP server thread panicked"))?
}

fn router(settings: &Settings, script: Option<String>) -> anyhow::Result<Router> {
    let router = match &settings.server_root {
        Some(root) => Router::new().fallback_service(ServeDir::new(root)),
        None => Router::new()
            .fallback(forward)
            .with_state(Arc::new(Proxy::new(&settings.project_url)?)),
    };

    Ok(match script {
        Some(script) => router.layer(map_response_with_state(
            Arc::new(script),
            inject_live_reload,
        )),
        None => router,
    })
}

struct Proxy {
    client: reqwest::Client,
    base: String,
}

impl Proxy {
    fn new(project_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base: base_url(project_url),
        })
    }

    async fn forward(&self, request: Request) -> anyhow::Result<Response> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut headers = parts.headers;
        headers.remove(header::HOST);
        // keep HTML uncompressed so the client script can be added
        headers.remove(header::ACCEPT_ENCODING);

        let body = to_bytes(body, BODY_LIMIT).await?;
        let upstream = self
            .client
            .request(parts.method, format!("{}{path}", self.base))
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);

        let mut response = Response::new(Body::from(upstream.bytes().await?));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        Ok(response)
    }
}

async fn forward(State(proxy): State<Arc<Proxy>>, request: Request) -> Response {
    match proxy.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("proxy to {} failed: {e}", proxy.base);
            (StatusCode::BAD_GATEWAY, format!("Couldn't reach {}:\n{e}", proxy.base)).into_response()
        }
    }
}

async fn inject_live_reload(State(script): State<Arc<String>>, response: Response) -> Response {
    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/html"));

    if !is_html {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = to_bytes(body, BODY_LIMIT).await else {
        return StatusCode::BAD_GATEWAY.into_response();
    };

    match String::from_utf8(bytes.to_vec()) {
        Ok(html) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(inject_script(&html, &script)))
        }
        Err(e) => Response::from_parts(parts, Body::from(e.into_bytes())),
    }
}

/// Places the script right before the last `</body>`, or at the very end.
pub(crate) fn inject_script(html: &str, script: &str) -> String {
    let tag = format!("<script>{script}</script>");

    // ASCII lowercasing keeps byte offsets intact
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(at) => {
            let mut out = String::with_capacity(html.len() + tag.len());
            out.push_str(&html[..at]);
            out.push_str(&tag);
            out.push_str(&html[at..]);
            out
        }
        None => format!("{html}{tag}"),
    }
}

fn base_url(project_url: &str) -> String {
    let url = project_url.trim_end_matches('/');

    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    let mut command = Command::new("open");
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut command = Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    };
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut command = Command::new("xdg-open");

    command
        .arg(url)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(drop)
}
