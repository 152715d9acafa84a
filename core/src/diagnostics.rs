//! Side channel for debug and error events.
//!
//! Failures are reported through `CallResult`; this is only for observers.
//! Every event goes to `tracing`, and additionally to an optional hook passed
//! in at client construction.

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Debug,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

pub type DiagnosticHook = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Diagnostics {
    hook: Option<DiagnosticHook>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: impl Fn(&Diagnostic) + Send + Sync + 'static) -> Self {
        Self {
            hook: Some(Arc::new(hook)),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: "cuc_rest_core", "{message}");
        self.emit(DiagnosticLevel::Debug, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(target: "cuc_rest_core", "{message}");
        self.emit(DiagnosticLevel::Error, message);
    }

    fn emit(&self, level: DiagnosticLevel, message: String) {
        if let Some(hook) = &self.hook {
            hook(&Diagnostic { level, message });
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
