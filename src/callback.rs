/// Local HTTP listener for the OAuth redirect
use crate::error::{AuthError, Result};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::{Host, Url};

const CALLBACK_PATH: &str = "/callback";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Loopback server that receives the provider's redirect
///
/// Stands in for the browser page the provider would normally navigate
/// back to: the raw query string is handed to
/// [`SessionManager::handle_callback`](crate::session::SessionManager::handle_callback)
/// and the browser gets a final page, so a reload cannot replay the code.
pub struct CallbackServer {
    listeners: Vec<TcpListener>,
    host: String,
    port: u16,
}

impl CallbackServer {
    /// Bind to `127.0.0.1:port` (0 picks a free port)
    pub fn bind(port: u16) -> Result<Self> {
        let listener = bind_listener(IpAddr::V4(Ipv4Addr::LOCALHOST), port)?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            listeners: vec![listener],
            host: "127.0.0.1".to_string(),
            port,
        })
    }

    /// Bind to `[::1]:port` (0 picks a free port)
    pub fn bind_ipv6(port: u16) -> Result<Self> {
        let listener = bind_listener(IpAddr::V6(Ipv6Addr::LOCALHOST), port)?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            listeners: vec![listener],
            host: "[::1]".to_string(),
            port,
        })
    }

    /// Bind to the address and port named in a loopback redirect URI
    ///
    /// Providers compare redirect URIs exactly, so the port must be the one
    /// registered with the client. `localhost` may resolve to either address
    /// family in the browser, so both loopback addresses are served.
    pub fn for_redirect_uri(redirect_uri: &str) -> Result<Self> {
        let url = Url::parse(redirect_uri)
            .map_err(|e| AuthError::Config(format!("Invalid redirect URI: {}", e)))?;
        let port = url.port_or_known_default().unwrap_or(0);

        match url.host() {
            Some(Host::Ipv4(ip)) if ip.is_loopback() => Self::bind(port),
            Some(Host::Ipv6(ip)) if ip.is_loopback() => Self::bind_ipv6(port),
            Some(Host::Domain("localhost")) => {
                let mut server = Self::bind(port)?;
                server.host = "localhost".to_string();
                match bind_listener(IpAddr::V6(Ipv6Addr::LOCALHOST), server.port) {
                    Ok(listener) => server.listeners.push(listener),
                    Err(e) => debug!(error = %e, "IPv6 loopback unavailable, serving IPv4 only"),
                }
                Ok(server)
            }
            _ => Err(AuthError::Config(format!(
                "Redirect URI {} is not a loopback address",
                redirect_uri
            ))),
        }
    }

    /// Get the redirect URI served by this listener
    pub fn redirect_uri(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, CALLBACK_PATH)
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for a request to the callback path
    ///
    /// Requests to other paths (favicons, probes) are answered with a 404
    /// and ignored, as are connections that fail or stay idle. Only the
    /// deadline or a listener error ends the wait.
    pub fn wait_for_callback(&self, timeout: Duration) -> Result<CallbackRequest> {
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() > deadline {
                return Err(AuthError::CallbackTimeout);
            }

            let mut accepted = false;
            for listener in &self.listeners {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        accepted = true;
                        debug!(%peer, "Accepted callback connection");
                        match read_request(stream) {
                            Ok(Some(request)) => return Ok(request),
                            Ok(None) => {}
                            Err(e) => warn!(%peer, error = %e, "Dropping callback connection"),
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if !accepted {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn bind_listener(ip: IpAddr, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((ip, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// A redirect received on the callback path, awaiting a response
pub struct CallbackRequest {
    query: String,
    stream: TcpStream,
}

impl CallbackRequest {
    /// Raw query string without the leading `?`
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Tell the browser the login completed
    pub fn respond_success(self) -> Result<()> {
        send_page(
            self.stream,
            "200 OK",
            "Authorization Successful",
            "You are logged in. You can close this window and return to your terminal.",
        )
    }

    /// Tell the browser the login failed
    pub fn respond_failure(self, message: &str) -> Result<()> {
        send_page(
            self.stream,
            "400 Bad Request",
            "Authorization Failed",
            message,
        )
    }
}

fn read_request(stream: TcpStream) -> Result<Option<CallbackRequest>> {
    // Accepted sockets inherit non-blocking mode on some platforms
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Drain the headers so closing the socket does not reset the connection
    let mut header = String::new();
    while reader.read_line(&mut header)? > 2 {
        header.clear();
    }

    // GET /callback?code=...&state=... HTTP/1.1
    let target = match request_line.split_whitespace().nth(1) {
        Some(target) => target,
        None => {
            send_page(stream, "400 Bad Request", "Bad Request", "Malformed request.")?;
            return Ok(None);
        }
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };

    if path != CALLBACK_PATH {
        debug!(path, "Ignoring request outside the callback path");
        send_page(stream, "404 Not Found", "Not Found", "Nothing to see here.")?;
        return Ok(None);
    }

    Ok(Some(CallbackRequest {
        query: query.to_string(),
        stream,
    }))
}

fn send_page(mut stream: TcpStream, status: &str, title: &str, message: &str) -> Result<()> {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #191414;
            color: #ffffff;
        }}
        .container {{ text-align: center; max-width: 420px; }}
        h1 {{ color: #1db954; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>{title}</h1>
        <p>{message}</p>
    </div>
</body>
</html>"#,
        title = escape_html(title),
        message = escape_html(message),
    );

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        html.len(),
        html
    );

    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
