//! Authenticated request issuance and outcome normalization.
//!
//! # Design
//! `RestClient` is the single chokepoint to one Unity Connection server. It
//! owns the executor, the session state, and a call lock. With
//! `serialize_calls` set (the default) one exchange is in flight per client,
//! media transfers included; the lock guard is dropped on every exit path.
//! Session reads happen before the send and writes after a successful
//! receive, each under the session mutex.
//!
//! Every public operation returns a `CallResult`. Transport errors, non-2xx
//! statuses, and unreadable bodies are classified into it rather than
//! returned as `Err`.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;

use crate::codec;
use crate::config::ClientConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{FailureKind, TransportError, ValidationError};
use crate::http::{HttpExecutor, HttpMethod, HttpRequest, HttpResponse, UreqExecutor};
use crate::parser::{self, ResponseParser, WireType};
use crate::property_list::PropertyList;
use crate::server::ConnectionServer;
use crate::session::SessionState;
use crate::types::CallResult;

pub(crate) const JSON_CONTENT: &str = "application/json";
pub(crate) const XML_CONTENT: &str = "application/xml";

/// Blocking client for the CUPI/CUMI/CUTI REST interfaces of one server.
pub struct RestClient {
    server: ConnectionServer,
    config: ClientConfig,
    executor: Arc<dyn HttpExecutor>,
    session: Mutex<SessionState>,
    call_lock: Mutex<()>,
    diagnostics: Diagnostics,
    parser: ResponseParser,
}

impl RestClient {
    pub fn new(server: ConnectionServer, config: ClientConfig) -> Self {
        let executor = UreqExecutor::new(config.timeout, config.accept_invalid_certs);
        Self::with_executor(server, config, executor)
    }

    pub fn with_executor(
        server: ConnectionServer,
        config: ClientConfig,
        executor: impl HttpExecutor + 'static,
    ) -> Self {
        Self {
            server,
            config,
            executor: Arc::new(executor),
            session: Mutex::new(SessionState::new()),
            call_lock: Mutex::new(()),
            diagnostics: Diagnostics::new(),
            parser: ResponseParser::default(),
        }
    }

    /// Route debug/error events to `diagnostics` in addition to `tracing`.
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.parser = ResponseParser::new(diagnostics.clone());
        self.diagnostics = diagnostics;
        self
    }

    pub fn server(&self) -> &ConnectionServer {
        &self.server
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn parser(&self) -> &ResponseParser {
        &self.parser
    }

    /// Cookie that would be replayed right now, if any.
    pub fn session_cookie(&self) -> Option<String> {
        self.session.lock().cookie().map(str::to_string)
    }

    pub fn clear_session(&self) {
        self.session.lock().clear();
    }

    /// Issue one request and normalize the outcome.
    ///
    /// `body` is written only when non-empty. `json_mode` selects the
    /// `Accept`/`Content-Type` pair and how a successful body is parsed.
    pub fn send(&self, url: &str, method: HttpMethod, body: &str, json_mode: bool) -> CallResult {
        if url.trim().is_empty() {
            return CallResult::invalid(method, url, ValidationError::Empty("url"));
        }
        let mut res = CallResult::for_request(method, url, body);
        let content_type = if json_mode { JSON_CONTENT } else { XML_CONTENT };

        let _exclusive = self.exclusive();
        let request = self
            .authorized(method, url)
            .header("Accept", content_type)
            .header("Content-Type", content_type)
            .body(body.as_bytes().to_vec());

        self.complete_exchange(&mut res, &request, Some(json_mode));
        res
    }

    /// `send` in the client's configured body mode.
    pub fn get_response(&self, url: &str, method: HttpMethod, body: &str) -> CallResult {
        self.send(url, method, body, self.config.json_mode)
    }

    /// Send `props` as a flat JSON object.
    pub fn get_json_response(&self, url: &str, method: HttpMethod, props: &PropertyList) -> CallResult {
        let body = if props.is_empty() {
            String::new()
        } else {
            codec::to_json_body(props)
        };
        self.send(url, method, &body, true)
    }

    /// Send `props` as `<root>...</root>`.
    pub fn get_xml_response(
        &self,
        url: &str,
        method: HttpMethod,
        root: &str,
        props: &PropertyList,
    ) -> CallResult {
        if root.trim().is_empty() {
            return CallResult::invalid(method, url, ValidationError::Empty("root element"));
        }
        match codec::to_xml_body(root, props) {
            Ok(body) => self.send(url, method, &body, false),
            Err(e) => {
                let mut res = CallResult::for_request(method, url, "");
                res.fail(FailureKind::Validation, format!("could not build XML body: {e}"));
                res
            }
        }
    }

    /// GET a JSON list and decode it. Decode failures leave the call
    /// successful with an empty list.
    pub fn get_object_list<T>(&self, url: &str) -> (CallResult, Vec<T>)
    where
        T: DeserializeOwned + WireType,
    {
        let res = self.send(url, HttpMethod::Get, "", true);
        if !res.success {
            return (res, Vec::new());
        }
        let items = self.parser.parse_object_list(&res.response_text, None);
        (res, items)
    }

    /// GET a single JSON object and decode it.
    pub fn get_object<T>(&self, url: &str) -> (CallResult, T)
    where
        T: DeserializeOwned + Default + WireType,
    {
        let res = self.send(url, HttpMethod::Get, "", true);
        if !res.success {
            return (res, T::default());
        }
        let item = self.parser.parse_object(&res.response_text, None);
        (res, item)
    }

    pub(crate) fn exclusive(&self) -> Option<MutexGuard<'_, ()>> {
        self.config.serialize_calls.then(|| self.call_lock.lock())
    }

    /// Request carrying proactive Basic auth and the session cookie when one
    /// is still fresh.
    pub(crate) fn authorized(&self, method: HttpMethod, url: &str) -> HttpRequest {
        let cookie = self
            .session
            .lock()
            .cookie_for_request(Instant::now(), self.config.session_idle_window);
        let mut request = HttpRequest::new(method, url)
            .header("Authorization", self.server.credentials.basic_auth_header())
            .header("User-Agent", self.config.user_agent.as_str());
        if let Some(cookie) = cookie {
            request = request.header("Cookie", cookie);
        }
        request
    }

    /// Execute `request` and classify the outcome into `res`, draining the
    /// body as text. `parse_as` selects JSON/XML population of a successful
    /// result; `None` leaves the body as raw text only.
    pub(crate) fn complete_exchange(
        &self,
        res: &mut CallResult,
        request: &HttpRequest,
        parse_as: Option<bool>,
    ) {
        let Some(mut response) = self.execute(res, request) else {
            return;
        };
        match response.read_text() {
            Ok(text) => res.response_text = text,
            Err(e) => {
                res.fail(FailureKind::Transport, format!("failed reading response body: {e}"));
                self.diagnostics.error(format!("{} {}: {}", request.method, request.url, res.error_text));
                return;
            }
        }

        if !response.is_success() {
            self.protocol_failure(res);
            return;
        }

        res.success = true;
        self.record_session(res, &response);
        match parse_as {
            Some(true) => self.populate_json(res),
            Some(false) => populate_xml(res),
            None => {}
        }
        if matches!(request.method, HttpMethod::Post | HttpMethod::Put) {
            if let Some(id) = parser::extract_object_id(&res.response_text) {
                res.returned_object_id = id;
            }
        }
    }

    /// Send the request and record the status line. `None` means the call
    /// already failed at the transport level.
    pub(crate) fn execute(&self, res: &mut CallResult, request: &HttpRequest) -> Option<HttpResponse> {
        tracing::debug!(method = %request.method, url = %request.url, "sending request");
        match self.executor.execute(request) {
            Ok(response) => {
                res.status_code = Some(response.status);
                res.status_description = response.reason.clone();
                Some(response)
            }
            Err(e) => {
                self.transport_failure(res, e);
                None
            }
        }
    }

    pub(crate) fn transport_failure(&self, res: &mut CallResult, err: TransportError) {
        res.fail(FailureKind::Transport, err.to_string());
        self.diagnostics.error(format!(
            "{} {} failed: {}",
            res.method.map_or("?", HttpMethod::as_str),
            res.url,
            res.error_text
        ));
    }

    /// Classify a non-2xx response whose body is already in `response_text`.
    pub(crate) fn protocol_failure(&self, res: &mut CallResult) {
        let status = res.status_code.unwrap_or_default();
        let text = parser::server_message(&res.response_text)
            .or_else(|| {
                let body = res.response_text.trim();
                (!body.is_empty()).then(|| body.to_string())
            })
            .unwrap_or_else(|| format!("HTTP {status} {}", res.status_description));
        res.fail(FailureKind::Protocol, text);
        tracing::warn!(status, url = %res.url, error = %res.error_text, "server returned an error status");
    }

    pub(crate) fn record_session(&self, res: &mut CallResult, response: &HttpResponse) {
        let mut session = self.session.lock();
        session.record_success(
            Instant::now(),
            &self.config.session_token_name,
            response.header_values("Set-Cookie"),
        );
        res.session_cookie = session.cookie().unwrap_or_default().to_string();
    }

    fn populate_json(&self, res: &mut CallResult) {
        if res.response_text.trim().is_empty() {
            return;
        }
        res.json_dictionary = codec::json_to_map(&res.response_text);
        res.total_object_count = parser::paging_total(&res.response_text).unwrap_or(0);
        if res.json_dictionary.is_none() && res.response_text.trim_start().starts_with('{') {
            self.diagnostics
                .debug(format!("response from {} is not a JSON object", res.url));
        }
    }
}

fn populate_xml(res: &mut CallResult) {
    res.xml_element = parser::try_parse_xml(&res.response_text);
    if let Some(total) = res
        .xml_element
        .as_ref()
        .and_then(|root| root.attribute("total"))
        .and_then(|t| t.trim().parse().ok())
    {
        res.total_object_count = total;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::time::Duration;

    use crate::diagnostics::DiagnosticLevel;
    use crate::types::User;

    /// Canned executor that records every request it sees.
    #[derive(Clone, Default)]
    pub(crate) struct FakeExecutor {
        pub requests: Arc<Mutex<Vec<HttpRequest>>>,
        replies: Arc<Mutex<VecDeque<Reply>>>,
    }

    pub(crate) enum Reply {
        Response {
            status: u16,
            headers: Vec<(String, String)>,
            body: Vec<u8>,
        },
        Unreachable,
    }

    impl FakeExecutor {
        pub fn reply(&self, status: u16, body: &str) -> &Self {
            self.reply_with(status, Vec::new(), body.as_bytes())
        }

        pub fn reply_with(&self, status: u16, headers: Vec<(&str, &str)>, body: &[u8]) -> &Self {
            self.replies.lock().push_back(Reply::Response {
                status,
                headers: headers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: body.to_vec(),
            });
            self
        }

        pub fn unreachable(&self) -> &Self {
            self.replies.lock().push_back(Reply::Unreachable);
            self
        }

        pub fn request(&self, index: usize) -> HttpRequest {
            self.requests.lock()[index].clone()
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    impl HttpExecutor for FakeExecutor {
        fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().push(request.clone());
            match self.replies.lock().pop_front() {
                Some(Reply::Response { status, headers, body }) => Ok(HttpResponse {
                    status,
                    reason: reason(status).to_string(),
                    headers,
                    body: Box::new(Cursor::new(body)),
                }),
                Some(Reply::Unreachable) | None => {
                    Err(TransportError::Connect("connection refused".to_string()))
                }
            }
        }
    }

    fn reason(status: u16) -> &'static str {
        match status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "",
        }
    }

    pub(crate) fn client_with(fake: &FakeExecutor) -> RestClient {
        RestClient::with_executor(
            ConnectionServer::new("cuc.test", "admin", "pass"),
            ClientConfig::default(),
            fake.clone(),
        )
    }

    #[test]
    fn request_carries_auth_and_mode_headers() {
        let fake = FakeExecutor::default();
        fake.reply(200, "{}").reply(200, "<x/>");
        let client = client_with(&fake);

        client.send("https://cuc.test:8443/vmrest/users", HttpMethod::Get, "", true);
        let req = fake.request(0);
        assert_eq!(req.header_value("Authorization"), Some("Basic YWRtaW46cGFzcw=="));
        assert_eq!(req.header_value("Accept"), Some("application/json"));
        assert_eq!(req.header_value("Content-Type"), Some("application/json"));
        assert!(req.header_value("Cookie").is_none());
        assert!(req.body.is_none());

        client.send("https://cuc.test:8443/vmrest/users", HttpMethod::Put, "<User/>", false);
        let req = fake.request(1);
        assert_eq!(req.header_value("Accept"), Some("application/xml"));
        assert_eq!(req.body.as_deref(), Some(&b"<User/>"[..]));
    }

    #[test]
    fn success_populates_json_and_total() {
        let fake = FakeExecutor::default();
        fake.reply(200, r#"{"User":[{"Alias":"jdoe"}],"@total":"1"}"#);
        let client = client_with(&fake);

        let (res, users) = client.get_object_list::<User>("https://cuc.test:8443/vmrest/users");
        assert!(res.success);
        assert_eq!(res.status_code, Some(200));
        assert_eq!(res.total_object_count, 1);
        assert!(res.json_dictionary.is_some());
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].alias, "jdoe");
    }

    #[test]
    fn xml_mode_parses_tree_and_total() {
        let fake = FakeExecutor::default();
        fake.reply(200, r#"<Users total="3"><User><Alias>a</Alias></User></Users>"#);
        let client = client_with(&fake);

        let res = client.send("https://cuc.test:8443/vmrest/users", HttpMethod::Get, "", false);
        assert!(res.success);
        assert_eq!(res.total_object_count, 3);
        assert_eq!(res.xml_element.map(|r| r.name), Some("Users".to_string()));
        assert!(res.json_dictionary.is_none());
    }

    #[test]
    fn transport_failure_has_no_status() {
        let fake = FakeExecutor::default();
        fake.unreachable();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let client = client_with(&fake)
            .with_diagnostics(Diagnostics::with_hook(move |d| sink.lock().push(d.level)));

        let res = client.send("https://nowhere:8443/vmrest/users", HttpMethod::Get, "", true);
        assert!(!res.success);
        assert_eq!(res.failure, Some(FailureKind::Transport));
        assert!(res.status_code.is_none());
        assert!(!res.error_text.is_empty());
        assert_eq!(*seen.lock(), vec![DiagnosticLevel::Error]);
    }

    #[test]
    fn not_found_keeps_server_message() {
        let fake = FakeExecutor::default();
        fake.reply(404, r#"{"errors":{"code":"NOT_FOUND","message":"user not found"}}"#);
        let client = client_with(&fake);

        let res = client.send("https://cuc.test:8443/vmrest/users/nope", HttpMethod::Get, "", true);
        assert!(!res.success);
        assert_eq!(res.failure, Some(FailureKind::Protocol));
        assert_eq!(res.status_code, Some(404));
        assert_eq!(res.status_description, "Not Found");
        assert_eq!(res.error_text, "user not found");
        assert!(res.response_text.contains("NOT_FOUND"));
    }

    #[test]
    fn error_without_body_uses_status_line() {
        let fake = FakeExecutor::default();
        fake.reply(500, "");
        let client = client_with(&fake);
        let res = client.send("https://cuc.test:8443/vmrest/users", HttpMethod::Delete, "", true);
        assert_eq!(res.error_text, "HTTP 500 Internal Server Error");
    }

    #[test]
    fn post_extracts_returned_object_id() {
        let fake = FakeExecutor::default();
        fake.reply(201, "/vmrest/users/6a9c1a4e-0e7f-4b8b-9d1c-52c0b9e1f111");
        let client = client_with(&fake);

        let mut props = PropertyList::new();
        props.add("Alias", "jdoe").add("ListInDirectory", true);
        let res = client.get_json_response("https://cuc.test:8443/vmrest/users?templateAlias=voicemailusertemplate", HttpMethod::Post, &props);
        assert!(res.success);
        assert_eq!(res.returned_object_id, "6a9c1a4e-0e7f-4b8b-9d1c-52c0b9e1f111");
        assert_eq!(res.request_body, r#"{"Alias":"jdoe","ListInDirectory":"1"}"#);
    }

    #[test]
    fn session_cookie_reused_then_expired() {
        let fake = FakeExecutor::default();
        fake.reply_with(200, vec![("Set-Cookie", "JSESSIONIDSSO=S1; Path=/; Secure")], b"{}")
            .reply(200, "{}")
            .reply(200, "{}");
        let config = ClientConfig::default().session_idle_window(Duration::from_millis(200));
        let client = RestClient::with_executor(ConnectionServer::new("cuc.test", "a", "b"), config, fake.clone());
        let url = "https://cuc.test:8443/vmrest/users";

        let first = client.send(url, HttpMethod::Get, "", true);
        assert_eq!(first.session_cookie, "JSESSIONIDSSO=S1");

        client.send(url, HttpMethod::Get, "", true);
        assert_eq!(fake.request(1).header_value("Cookie"), Some("JSESSIONIDSSO=S1"));

        std::thread::sleep(Duration::from_millis(300));
        client.send(url, HttpMethod::Get, "", true);
        assert!(fake.request(2).header_value("Cookie").is_none());
        assert!(fake.request(2).header_value("Authorization").is_some());
    }

    #[test]
    fn failed_call_does_not_touch_session() {
        let fake = FakeExecutor::default();
        fake.reply_with(404, vec![("Set-Cookie", "JSESSIONIDSSO=BAD")], b"");
        let client = client_with(&fake);
        client.send("https://cuc.test:8443/vmrest/users/x", HttpMethod::Get, "", true);
        assert!(client.session_cookie().is_none());
    }

    #[test]
    fn empty_url_is_rejected_before_sending() {
        let fake = FakeExecutor::default();
        let client = client_with(&fake);
        let res = client.send("  ", HttpMethod::Get, "", true);
        assert_eq!(res.failure, Some(FailureKind::Validation));
        assert_eq!(fake.request_count(), 0);
    }

    #[test]
    fn xml_body_built_from_properties() {
        let fake = FakeExecutor::default();
        fake.reply(204, "");
        let client = client_with(&fake);
        let props = PropertyList::with("DisplayName", "A & B");
        let res = client.get_xml_response("https://cuc.test:8443/vmrest/users/1", HttpMethod::Put, "User", &props);
        assert!(res.success);
        assert_eq!(res.request_body, "<User><DisplayName>A &amp; B</DisplayName></User>");
        assert!(res.xml_element.is_none());
    }

    #[test]
    fn undecodable_list_is_empty_but_successful() {
        let fake = FakeExecutor::default();
        fake.reply(200, r#"{"User":"oops","@total":"1"}"#);
        let client = client_with(&fake);
        let (res, users) = client.get_object_list::<User>("https://cuc.test:8443/vmrest/users");
        assert!(res.success);
        assert!(users.is_empty());
    }

    /// Executor that tracks how many exchanges are in flight at once.
    struct Slow {
        active: std::sync::atomic::AtomicUsize,
        max_seen: std::sync::atomic::AtomicUsize,
    }

    impl HttpExecutor for Arc<Slow> {
        fn execute(&self, _request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            use std::sync::atomic::Ordering;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                reason: "OK".to_string(),
                headers: Vec::new(),
                body: Box::new(Cursor::new(b"{}".to_vec())),
            })
        }
    }

    /// Run JSON calls, WAV uploads and downloads from six threads at once and
    /// report the highest number of exchanges seen in flight together.
    fn peak_concurrency(serialize_calls: bool) -> usize {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Barrier;

        let slow = Arc::new(Slow {
            active: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let client = Arc::new(RestClient::with_executor(
            ConnectionServer::new("cuc.test", "a", "b"),
            ClientConfig::default().serialize_calls(serialize_calls),
            Arc::clone(&slow),
        ));
        let dir = Arc::new(tempfile::tempdir().unwrap());
        let wav = dir.path().join("upload.wav");
        std::fs::write(&wav, vec![1u8; 64]).unwrap();
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let client = Arc::clone(&client);
                let barrier = Arc::clone(&barrier);
                let dir = Arc::clone(&dir);
                let wav = wav.clone();
                std::thread::spawn(move || {
                    let url = "https://cuc.test:8443/vmrest/users/u1/voicename";
                    barrier.wait();
                    match i % 3 {
                        0 => client.send("https://cuc.test:8443/vmrest/users", HttpMethod::Get, "", true),
                        1 => client.upload_binary_put(url, &wav),
                        _ => client.download_binary(url, &dir.path().join(format!("down{i}.wav"))),
                    }
                })
            })
            .collect();
        for handle in handles {
            let res = handle.join().unwrap();
            assert!(res.success, "{}", res.error_text);
        }
        slow.max_seen.load(Ordering::SeqCst)
    }

    #[test]
    fn media_and_json_calls_share_the_call_lock() {
        assert_eq!(peak_concurrency(true), 1);
    }

    #[test]
    fn unserialized_client_lets_calls_overlap() {
        assert!(peak_concurrency(false) > 1);
    }

    #[test]
    fn unserialized_calls_leave_one_issued_cookie() {
        let fake = FakeExecutor::default();
        let issued: Vec<String> = (1..=8).map(|i| format!("JSESSIONIDSSO=S{i}")).collect();
        for cookie in &issued {
            fake.reply_with(200, vec![("Set-Cookie", cookie.as_str())], b"{}");
        }
        let client = Arc::new(RestClient::with_executor(
            ConnectionServer::new("cuc.test", "a", "b"),
            ClientConfig::default().serialize_calls(false),
            fake.clone(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = Arc::clone(&client);
                std::thread::spawn(move || client.send("https://cuc.test:8443/vmrest/users", HttpMethod::Get, "", true))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().success);
        }

        let kept = client.session_cookie().unwrap();
        assert!(issued.contains(&kept), "unexpected cookie {kept}");
        assert_eq!(fake.request_count(), 8);
    }
}
