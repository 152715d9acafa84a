//! Addressing and credentials for one Unity Connection server.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Port the configuration and messaging APIs listen on.
pub const DEFAULT_PORT: u16 = 8443;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }

    /// Value for the `Authorization` header.
    pub fn basic_auth_header(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.login, self.password));
        format!("Basic {token}")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionServer {
    pub server_name: String,
    pub port: u16,
    pub scheme: String,
    pub credentials: Credentials,
}

impl ConnectionServer {
    pub fn new(server_name: &str, login: &str, password: &str) -> Self {
        Self {
            server_name: server_name.trim().to_string(),
            port: DEFAULT_PORT,
            scheme: "https".to_string(),
            credentials: Credentials::new(login, password),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Plain `http` is only useful against local stub servers.
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    /// `https://{server}:{port}/vmrest/`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}/vmrest/", self.scheme, self.server_name, self.port)
    }

    /// Resource URL under `/vmrest/`; leading slashes on `path` are ignored.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_is_base64_of_login_and_password() {
        let creds = Credentials::new("admin", "ecsbulab");
        assert_eq!(creds.basic_auth_header(), "Basic YWRtaW46ZWNzYnVsYWI=");
    }

    #[test]
    fn debug_hides_password() {
        let creds = Credentials::new("admin", "secret");
        assert!(!format!("{creds:?}").contains("secret"));
    }

    #[test]
    fn urls_are_built_under_vmrest() {
        let server = ConnectionServer::new(" cuc1.example.com ", "a", "b");
        assert_eq!(server.base_url(), "https://cuc1.example.com:8443/vmrest/");
        assert_eq!(server.url("/users?query=(alias is jdoe)"), "https://cuc1.example.com:8443/vmrest/users?query=(alias is jdoe)");

        let local = ConnectionServer::new("127.0.0.1", "a", "b").with_scheme("http").with_port(3000);
        assert_eq!(local.url("calls"), "http://127.0.0.1:3000/vmrest/calls");
    }
}
