//! Skips network tests where the sandbox forbids binding local sockets.

use wiremock::MockServer;

/// Whether a loopback listener can be bound.
pub fn sockets_available() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Starts a mock server, or returns `None` (after a notice) when sockets are unavailable.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if !sockets_available() {
        eprintln!("skipping test: cannot bind a loopback socket in this environment");
        return None;
    }
    Some(MockServer::start().await)
}
