//! The normalized call outcome and a sample domain type.

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::codec::{self, XmlElement};
use crate::error::FailureKind;
use crate::http::HttpMethod;
use crate::parser::WireType;
use crate::property_list::PropertyList;

/// Outcome of one call, successful or not.
///
/// `success` implies a 2xx `status_code` and a `response_text` holding what
/// the server sent. A failed result always has a non-empty `error_text` and a
/// `failure` kind; transport failures have no `status_code`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub response_text: String,
    pub error_text: String,
    pub status_code: Option<u16>,
    pub status_description: String,
    pub xml_element: Option<XmlElement>,
    pub json_dictionary: Option<Map<String, Value>>,
    pub total_object_count: usize,
    pub url: String,
    pub method: Option<HttpMethod>,
    pub request_body: String,
    pub misc: String,
    pub returned_object_id: String,
    pub session_cookie: String,
}

impl CallResult {
    pub(crate) fn for_request(method: HttpMethod, url: &str, request_body: &str) -> Self {
        Self {
            success: false,
            failure: None,
            response_text: String::new(),
            error_text: String::new(),
            status_code: None,
            status_description: String::new(),
            xml_element: None,
            json_dictionary: None,
            total_object_count: 0,
            url: url.to_string(),
            method: Some(method),
            request_body: request_body.to_string(),
            misc: String::new(),
            returned_object_id: String::new(),
            session_cookie: String::new(),
        }
    }

    /// A result rejected before any network call.
    pub(crate) fn invalid(method: HttpMethod, url: &str, error: impl std::fmt::Display) -> Self {
        let mut res = Self::for_request(method, url, "");
        res.fail(FailureKind::Validation, error.to_string());
        res
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, error_text: impl Into<String>) {
        let text = error_text.into();
        self.success = false;
        self.failure = Some(kind);
        self.error_text = if text.is_empty() {
            format!("{kind} failure")
        } else {
            text
        };
    }

    /// Status line plus error text, for presenting to an operator.
    pub fn summary(&self) -> String {
        match (self.success, self.status_code) {
            (true, Some(code)) => format!("{code} {}", self.status_description),
            (false, Some(code)) => format!("{code} {}: {}", self.status_description, self.error_text),
            (_, None) => self.error_text.clone(),
        }
    }
}

/// Minimal user record, enough to drive list/get/update round trips.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct User {
    pub object_id: String,
    pub alias: String,
    pub display_name: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "DtmfAccessId")]
    pub extension: String,
    #[serde(deserialize_with = "wire_bool")]
    pub list_in_directory: bool,
    #[serde(deserialize_with = "wire_date")]
    pub creation_time: Option<NaiveDateTime>,
}

impl WireType for User {
    const TYPE_NAME: &'static str = "User";
}

impl User {
    /// Every writable field as an update payload. `ObjectId` and
    /// `CreationTime` are server-owned and left out.
    pub fn to_property_list(&self) -> PropertyList {
        let mut props = PropertyList::new();
        props
            .add("Alias", self.alias.as_str())
            .add("DisplayName", self.display_name.as_str())
            .add("FirstName", self.first_name.as_str())
            .add("LastName", self.last_name.as_str())
            .add("DtmfAccessId", self.extension.as_str())
            .add("ListInDirectory", self.list_in_directory);
        props
    }
}

/// Accepts `"true"`, `"1"`, or a JSON boolean.
fn wire_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::String(s) => codec::decode_bool(&s).unwrap_or(false),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    })
}

fn wire_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.as_deref().and_then(codec::decode_date))
}
