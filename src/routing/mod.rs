//! Seam towards the call-routing message bus
//!
//! Every exchange is a flat key/value record. [`MessageBus::dispatch`]
//! waits for a handler and lets it fill in parameters and a return value;
//! [`MessageBus::enqueue`] only notifies.
use async_trait::async_trait;
use std::{collections::BTreeMap, fmt};

pub const CALL_PREROUTE: &str = "call.preroute";
pub const CALL_ROUTE: &str = "call.route";
pub const CALL_EXECUTE: &str = "call.execute";
pub const CALL_ANSWERED: &str = "call.answered";
pub const CALL_RINGING: &str = "call.ringing";
pub const CALL_PROGRESS: &str = "call.progress";
pub const CALL_UPDATE: &str = "call.update";
pub const CALL_TRANSFER: &str = "call.transfer";
pub const CHAN_DTMF: &str = "chan.dtmf";
pub const CHAN_TEXT: &str = "chan.text";
pub const CHAN_HANGUP: &str = "chan.hangup";
pub const USER_REGISTER: &str = "user.register";
pub const USER_UNREGISTER: &str = "user.unregister";

/// Values of the `operation` parameter of `call.update`
pub mod update {
    pub const REQUEST: &str = "request";
    pub const NOTIFY: &str = "notify";
    pub const REJECT: &str = "reject";
    pub const INITIATE: &str = "initiate";
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusMessage {
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub ret_value: String,
}

impl BusMessage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.set_param(key, value);
        self
    }

    pub fn set_param(&mut self, key: &str, value: impl ToString) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Boolean parameter in the `yes/true/on/enable/1` convention
    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.param(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("yes" | "true" | "on" | "enable" | "1")
        )
    }

    pub fn error(&self) -> Option<&str> {
        self.param("error").filter(|e| !e.is_empty())
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.ret_value.is_empty() {
            write!(f, " -> {}", self.ret_value)?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Delivers `msg` to its handlers; false when nobody handled it
    async fn dispatch(&self, msg: &mut BusMessage) -> bool;
    /// Queues `msg` without waiting for a handler
    fn enqueue(&self, msg: BusMessage);
}

/// SIP status for a routing error name, falling back to 500
pub fn error_to_code(error: &str) -> (u16, &'static str) {
    match error {
        "incomplete" => (484, "Address Incomplete"),
        "noroute" | "offline" => (404, "Not Found"),
        "noconn" | "service-unavailable" => (503, "Service Unavailable"),
        "noauth" => (401, "Unauthorized"),
        "nomedia" => (415, "Unsupported Media Type"),
        "busy" => (486, "Busy Here"),
        "noanswer" | "timeout" => (408, "Request Timeout"),
        "rejected" | "forbidden" => (403, "Forbidden"),
        "declined" => (603, "Decline"),
        "congestion" => (480, "Temporarily Unavailable"),
        "looping" => (483, "Too Many Hops"),
        "pending" => (491, "Request Pending"),
        "cancelled" | "interrupted" => (487, "Request Terminated"),
        "notacceptable" => (488, "Not Acceptable Here"),
        "moved" => (410, "Gone"),
        _ => (500, "Server Internal Error"),
    }
}

/// Routing error name for a SIP status, used when reporting hangups
pub fn code_to_error(code: u16) -> &'static str {
    match code {
        401 | 407 => "noauth",
        403 => "forbidden",
        404 | 604 => "noroute",
        408 => "timeout",
        410 => "moved",
        415 => "nomedia",
        480 => "congestion",
        483 => "looping",
        484 => "incomplete",
        486 | 600 => "busy",
        487 => "cancelled",
        488 | 606 => "notacceptable",
        491 => "pending",
        503 => "noconn",
        603 => "declined",
        _ => "failure",
    }
}
