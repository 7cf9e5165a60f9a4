/// Authorization callback parsing and a loopback callback server
use crate::error::{OAuthError, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Authorization code and state delivered to the redirect URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

impl CallbackParams {
    /// Parse the query string of a callback request
    ///
    /// ```
    /// use raitha_digilocker::callback::CallbackParams;
    ///
    /// let params = CallbackParams::from_query("code=abc&state=xyz").unwrap();
    /// assert_eq!(params.code, "abc");
    /// ```
    pub fn from_query(query: &str) -> Result<Self> {
        let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        if let Some(error) = params.get("error") {
            if error == "access_denied" {
                return Err(OAuthError::AuthorizationDenied);
            }
            return Err(OAuthError::OAuthErrorResponse {
                error: error.clone(),
                description: params.get("error_description").cloned(),
            });
        }

        let code = params
            .get("code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthError::MissingField("code".into()))?;
        let state = params
            .get("state")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OAuthError::MissingField("state".into()))?;

        Ok(Self {
            code: code.clone(),
            state: state.clone(),
        })
    }

    /// Parse a full callback URL
    pub fn from_url(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        Self::from_query(url.query().unwrap_or(""))
    }
}

/// Local callback server for logging in from a terminal
pub struct CallbackServer {
    listener: TcpListener,
    port: u16,
}

impl CallbackServer {
    /// Create a new callback server on a random available port
    pub fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        Ok(Self { listener, port })
    }

    /// Get the redirect URI for this server
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the authorization callback, giving up after `timeout`
    pub fn wait_for_callback(&self, timeout: Duration) -> Result<CallbackParams> {
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() > deadline {
                return Err(OAuthError::CallbackTimeout);
            }

            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Some(params) = handle_request(stream)? {
                        return Ok(params);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept callback connection");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

fn handle_request(stream: TcpStream) -> Result<Option<CallbackParams>> {
    let target = match read_request_target(&stream) {
        Ok(Some(target)) => target,
        Ok(None) => {
            debug!("connection closed without a request line");
            return Ok(None);
        }
        Err(e) => {
            warn!(error = %e, "dropping unreadable callback request");
            return Ok(None);
        }
    };

    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));

    if path != "/callback" {
        debug!(path, "ignoring request outside the callback path");
        respond(stream, "404 Not Found", "Not found");
        return Ok(None);
    }

    match CallbackParams::from_query(query) {
        Ok(params) => {
            respond(
                stream,
                "200 OK",
                "DigiLocker authorization complete. You can close this window.",
            );
            Ok(Some(params))
        }
        Err(e) => {
            warn!(error = %e, "authorization callback carried an error");
            respond(stream, "400 Bad Request", &format!("Authorization failed: {}", e));
            Err(e)
        }
    }
}

/// Request target of `GET /callback?code=...&state=... HTTP/1.1`, or `None`
/// when the peer sent nothing
fn read_request_target(stream: &TcpStream) -> std::io::Result<Option<String>> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(None);
    }

    // Drain headers so closing the socket does not reset the connection.
    let mut header = String::new();
    while reader.read_line(&mut header)? > 0 && !header.trim_end().is_empty() {
        header.clear();
    }

    Ok(request_line.split_whitespace().nth(1).map(String::from))
}

fn respond(stream: TcpStream, status: &str, message: &str) {
    if let Err(e) = send_response(stream, status, message) {
        debug!(error = %e, "failed to write callback response");
    }
}

fn send_response(mut stream: TcpStream, status: &str, message: &str) -> Result<()> {
    let html = format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>DigiLocker</title></head>\
         <body><p>{}</p></body></html>",
        message
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
