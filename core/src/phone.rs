//! Phone-based recording and playback over CUTI.
//!
//! A `PhoneRecording` wraps one outbound call placed by the server to a
//! phone number. It is created with the two-phase `connect` factory, which
//! only returns once the callee has picked up; the call is torn down when
//! the value is dropped.

use std::fmt;
use std::thread;
use std::time::Duration;

use crate::client::RestClient;
use crate::codec;
use crate::error::{FailureKind, PhoneError};
use crate::http::HttpMethod;
use crate::media::play_control;
use crate::property_list::PropertyList;
use crate::types::CallResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneRecordingOptions {
    pub max_rings: u32,
    /// Connection status checks before giving up.
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for PhoneRecordingOptions {
    fn default() -> Self {
        Self {
            max_rings: 4,
            poll_attempts: 15,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// A live CUTI call.
pub struct PhoneRecording<'a> {
    client: &'a RestClient,
    call_id: String,
    recording_id: Option<String>,
    hung_up: bool,
}

impl<'a> PhoneRecording<'a> {
    /// Dial `number` and wait for the callee to answer.
    pub fn connect(
        client: &'a RestClient,
        number: &str,
        options: &PhoneRecordingOptions,
    ) -> Result<Self, PhoneError> {
        let number = number.trim();
        if number.is_empty() {
            return Err(PhoneError::Empty("phone number"));
        }

        let mut props = PropertyList::new();
        props.add("number", number).add("maximumRings", options.max_rings);
        let res = client.get_json_response(&client.server().url("calls"), HttpMethod::Post, &props);
        if !res.success {
            return Err(PhoneError::CallRequest(res.error_text));
        }
        if res.returned_object_id.is_empty() {
            return Err(PhoneError::MissingCallId(res.response_text));
        }

        let mut call = Self {
            client,
            call_id: res.returned_object_id,
            recording_id: None,
            hung_up: false,
        };
        tracing::debug!(call_id = %call.call_id, number, "call placed, waiting for answer");

        for attempt in 0..options.poll_attempts {
            if attempt > 0 {
                thread::sleep(options.poll_interval);
            }
            if call.is_connected() {
                return Ok(call);
            }
        }

        call.hang_up();
        Err(PhoneError::NotConnected {
            attempts: options.poll_attempts,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Resource id of the most recent successful recording.
    pub fn recording_id(&self) -> Option<&str> {
        self.recording_id.as_deref()
    }

    fn call_url(&self) -> String {
        self.client.server().url(&format!("calls/{}", self.call_id))
    }

    /// Ask the server whether the call is still up.
    pub fn is_connected(&self) -> bool {
        if self.hung_up {
            return false;
        }
        let res = self.client.send(&self.call_url(), HttpMethod::Get, "", true);
        if !res.success {
            return false;
        }
        res.json_dictionary
            .as_ref()
            .and_then(|map| map.get("connected"))
            .and_then(codec::json_value_text)
            .and_then(|text| codec::decode_bool(&text))
            .unwrap_or(false)
    }

    /// Record from the phone until the callee stops (hangs up or presses a
    /// key). The new resource id lands in `returned_object_id`.
    pub fn record(&mut self) -> CallResult {
        if self.hung_up {
            return CallResult::invalid(HttpMethod::Post, &self.call_url(), PhoneError::Disconnected(self.call_id.clone()));
        }
        let mut props = PropertyList::new();
        props.add("op", "RECORD");
        let mut res = self
            .client
            .get_json_response(&self.call_url(), HttpMethod::Post, &props);
        if !res.success {
            return res;
        }

        let resource_id = res
            .json_dictionary
            .as_ref()
            .and_then(|map| map.get("resourceId"))
            .and_then(codec::json_value_text)
            .filter(|id| !id.trim().is_empty());
        match resource_id {
            Some(id) => {
                res.returned_object_id = id.clone();
                self.recording_id = Some(id);
            }
            None => {
                let text = PhoneError::Control(format!("no resourceId in '{}'", res.response_text));
                res.fail(FailureKind::Parse, text.to_string());
            }
        }
        res
    }

    /// Play a stream resource (a recording or a stream-library file) to the
    /// phone. Volume and speed are percentages; 100 is normal.
    pub fn play(&self, resource_id: &str, volume: u32, speed: u32, start_ms: u64) -> CallResult {
        if resource_id.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Post, &self.call_url(), PhoneError::Empty("resource id"));
        }
        if self.hung_up {
            return CallResult::invalid(HttpMethod::Post, &self.call_url(), PhoneError::Disconnected(self.call_id.clone()));
        }
        let props = play_control(resource_id, volume, speed, start_ms);
        self.client
            .get_json_response(&self.call_url(), HttpMethod::Post, &props)
    }

    /// End the call. Returns `None` when it was already ended.
    pub fn hang_up(&mut self) -> Option<CallResult> {
        if self.hung_up {
            return None;
        }
        self.hung_up = true;
        let res = self.client.send(&self.call_url(), HttpMethod::Delete, "", true);
        if !res.success {
            tracing::warn!(call_id = %self.call_id, error = %res.error_text, "hang up failed");
        }
        Some(res)
    }
}

impl fmt::Debug for PhoneRecording<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhoneRecording")
            .field("call_id", &self.call_id)
            .field("recording_id", &self.recording_id)
            .field("hung_up", &self.hung_up)
            .finish()
    }
}

impl Drop for PhoneRecording<'_> {
    fn drop(&mut self) {
        self.hang_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{client_with, FakeExecutor};

    fn fast() -> PhoneRecordingOptions {
        PhoneRecordingOptions {
            max_rings: 2,
            poll_attempts: 3,
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn connect_waits_for_answer() {
        let fake = FakeExecutor::default();
        fake.reply(201, "vmrest/calls/7")
            .reply(200, r#"{"id":"7","connected":"false"}"#)
            .reply(200, r#"{"id":"7","connected":"true"}"#)
            .reply(204, "");
        let client = client_with(&fake);

        let call = PhoneRecording::connect(&client, "1001", &fast()).unwrap();
        assert_eq!(call.call_id(), "7");
        let dial = fake.request(0);
        assert!(dial.url.ends_with("/vmrest/calls"));
        assert_eq!(dial.body.as_deref(), Some(&br#"{"number":"1001","maximumRings":"2"}"#[..]));
        assert!(fake.request(2).url.ends_with("/vmrest/calls/7"));

        drop(call);
        assert_eq!(fake.request(3).method, HttpMethod::Delete);
    }

    #[test]
    fn unanswered_call_is_hung_up() {
        let fake = FakeExecutor::default();
        fake.reply(201, "vmrest/calls/9");
        for _ in 0..3 {
            fake.reply(200, r#"{"connected":"false"}"#);
        }
        fake.reply(204, "");
        let client = client_with(&fake);

        let err = PhoneRecording::connect(&client, "1001", &fast()).unwrap_err();
        assert!(matches!(err, PhoneError::NotConnected { attempts: 3 }));
        assert_eq!(fake.request_count(), 5);
        assert_eq!(fake.request(4).method, HttpMethod::Delete);
    }

    #[test]
    fn dial_failures_are_errors() {
        let fake = FakeExecutor::default();
        let client = client_with(&fake);
        assert!(matches!(
            PhoneRecording::connect(&client, " ", &fast()),
            Err(PhoneError::Empty(_))
        ));

        fake.reply(500, r#"{"message":"no ports"}"#);
        match PhoneRecording::connect(&client, "1001", &fast()) {
            Err(PhoneError::CallRequest(text)) => assert_eq!(text, "no ports"),
            other => panic!("unexpected {other:?}"),
        }

        fake.reply(201, "");
        assert!(matches!(
            PhoneRecording::connect(&client, "1001", &fast()),
            Err(PhoneError::MissingCallId(_))
        ));
    }

    #[test]
    fn record_then_play_back() {
        let fake = FakeExecutor::default();
        fake.reply(201, "vmrest/calls/3")
            .reply(200, r#"{"connected":"true"}"#)
            .reply(200, r#"{"op":"RECORD","resourceId":"rec-55.wav","lastResult":"0"}"#)
            .reply(200, r#"{"op":"PLAY","lastResult":"0"}"#)
            .reply(204, "");
        let client = client_with(&fake);
        let mut call = PhoneRecording::connect(&client, "1001", &fast()).unwrap();

        let recorded = call.record();
        assert!(recorded.success, "{}", recorded.error_text);
        assert_eq!(recorded.returned_object_id, "rec-55.wav");
        assert_eq!(call.recording_id(), Some("rec-55.wav"));

        let played = call.play("rec-55.wav", 100, 100, 0);
        assert!(played.success);
        let body = String::from_utf8(fake.request(3).body.unwrap()).unwrap();
        assert!(body.starts_with(r#"{"op":"PLAY","resourceType":"STREAM","resourceId":"rec-55.wav""#));

        assert!(call.hang_up().is_some());
        assert!(call.hang_up().is_none());
        assert!(!call.is_connected());
        drop(call);
        assert_eq!(fake.request_count(), 5);
    }

    #[test]
    fn record_without_resource_id_fails() {
        let fake = FakeExecutor::default();
        fake.reply(201, "vmrest/calls/3")
            .reply(200, r#"{"connected":"1"}"#)
            .reply(200, r#"{"lastResult":"0"}"#)
            .reply(204, "");
        let client = client_with(&fake);
        let mut call = PhoneRecording::connect(&client, "1001", &fast()).unwrap();

        let res = call.record();
        assert!(!res.success);
        assert_eq!(res.failure, Some(FailureKind::Parse));
        assert!(call.recording_id().is_none());
    }

    #[test]
    fn ended_call_rejects_control() {
        let fake = FakeExecutor::default();
        fake.reply(201, "vmrest/calls/3")
            .reply(200, r#"{"connected":true}"#)
            .reply(204, "");
        let client = client_with(&fake);
        let mut call = PhoneRecording::connect(&client, "1001", &fast()).unwrap();
        call.hang_up();

        let res = call.record();
        assert_eq!(res.failure, Some(FailureKind::Validation));
        assert!(res.error_text.contains("no longer connected"));
        assert_eq!(call.play("x.wav", 100, 100, 0).failure, Some(FailureKind::Validation));
        assert_eq!(fake.request_count(), 3);
    }
}
