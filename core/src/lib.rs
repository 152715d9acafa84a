//! Blocking transport core for the Cisco Unity Connection REST interfaces
//! (CUPI provisioning, CUMI messaging, CUTI telephony).
//!
//! # Overview
//! `RestClient` issues authenticated requests against one server and folds
//! every outcome, including transport errors, into a `CallResult`.
//! `PropertyList` and the `codec` module build request bodies;
//! `ResponseParser` turns wrapped list responses into typed values; the
//! `media` and `phone` modules add binary WAV transfer and phone-driven
//! recording on top of the same client.
//!
//! # Design
//! - Network I/O sits behind the `HttpExecutor` trait. `UreqExecutor` is the
//!   production implementation; tests substitute in-process fakes.
//! - One client owns one session cookie and, by default, runs one exchange
//!   at a time.
//! - Domain types own `String`/`Vec` fields and decode with serde; updates are
//!   built explicitly through `PropertyList` rather than by reflection.

pub mod client;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod media;
pub mod parser;
pub mod phone;
pub mod property_list;
pub mod server;
pub mod session;
pub mod types;

pub use client::RestClient;
pub use config::ClientConfig;
pub use diagnostics::{Diagnostic, DiagnosticLevel, Diagnostics};
pub use error::{ConfigError, FailureKind, PhoneError, TransportError, ValidationError};
pub use http::{HttpExecutor, HttpMethod, HttpRequest, HttpResponse, UreqExecutor};
pub use media::MultipartPart;
pub use parser::{ResponseParser, WireType};
pub use phone::{PhoneRecording, PhoneRecordingOptions};
pub use property_list::{PropertyList, PropertyPair};
pub use server::{ConnectionServer, Credentials};
pub use types::{CallResult, User};
