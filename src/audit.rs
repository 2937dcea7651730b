//! Structured audit events for the TFTP session lifecycle, logged
//! through `tracing` as a single JSON field so any subscriber layer
//! (file, stdout, SIEM forwarder) sees the same structured record.

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted { common: CommonFields, bind_addr: String, datastore: String },
    ServerShutdown { common: CommonFields, reason: String },
    ReadRequest { common: CommonFields, client_addr: String, filename: String },
    ReadDenied { common: CommonFields, client_addr: String, filename: String, reason: String },
    WriteRequest { common: CommonFields, client_addr: String, filename: String },
    WriteRequestDenied { common: CommonFields, client_addr: String, filename: String, reason: String },
    TransferCompleted { common: CommonFields, client_addr: String, filename: String, bytes: u64 },
    TransferFailed { common: CommonFields, client_addr: String, filename: String, error: String },
    ProtocolViolation { common: CommonFields, client_addr: String, detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    pub severity: String,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: nix::unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "tundra-tftpd".to_string(),
            severity: severity.to_string(),
        }
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let json = serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"error\":\"failed to serialize audit event: {e}\"}}"));
        let severity = match self {
            AuditEvent::ReadDenied { common, .. }
            | AuditEvent::WriteRequestDenied { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::ProtocolViolation { common, .. } => common.severity.as_str(),
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::TransferCompleted { common, .. } => common.severity.as_str(),
        };
        match severity {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }
}

pub fn server_started(bind_addr: &str, datastore: &str) {
    AuditEvent::ServerStarted {
        common: CommonFields::new("info"),
        bind_addr: bind_addr.to_string(),
        datastore: datastore.to_string(),
    }
    .log();
}

pub fn server_shutdown(reason: &str) {
    AuditEvent::ServerShutdown { common: CommonFields::new("info"), reason: reason.to_string() }.log();
}

pub fn transfer_failed(client_addr: &str, filename: &str, error: &str) {
    AuditEvent::TransferFailed {
        common: CommonFields::new("warn"),
        client_addr: client_addr.to_string(),
        filename: filename.to_string(),
        error: error.to_string(),
    }
    .log();
}

pub fn read_request(client_addr: &str, filename: &str) {
    AuditEvent::ReadRequest {
        common: CommonFields::new("info"),
        client_addr: client_addr.to_string(),
        filename: filename.to_string(),
    }
    .log();
}

pub fn read_denied(client_addr: &str, filename: &str, reason: &str) {
    AuditEvent::ReadDenied {
        common: CommonFields::new("warn"),
        client_addr: client_addr.to_string(),
        filename: filename.to_string(),
        reason: reason.to_string(),
    }
    .log();
}

pub fn write_request(client_addr: &str, filename: &str) {
    AuditEvent::WriteRequest {
        common: CommonFields::new("info"),
        client_addr: client_addr.to_string(),
        filename: filename.to_string(),
    }
    .log();
}

pub fn write_request_denied(client_addr: &str, filename: &str, reason: &str) {
    AuditEvent::WriteRequestDenied {
        common: CommonFields::new("warn"),
        client_addr: client_addr.to_string(),
        filename: filename.to_string(),
        reason: reason.to_string(),
    }
    .log();
}

pub fn transfer_completed(client_addr: &str, filename: &str, bytes: u64) {
    AuditEvent::TransferCompleted {
        common: CommonFields::new("info"),
        client_addr: client_addr.to_string(),
        filename: filename.to_string(),
        bytes,
    }
    .log();
}

pub fn protocol_violation(client_addr: &str, detail: &str) {
    AuditEvent::ProtocolViolation {
        common: CommonFields::new("warn"),
        client_addr: client_addr.to_string(),
        detail: detail.to_string(),
    }
    .log();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_fields_stamp_service_name() {
        let fields = CommonFields::new("info");
        assert_eq!(fields.service, "tundra-tftpd");
    }

    #[test]
    fn server_started_serializes_as_tagged_json() {
        let event = AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: "0.0.0.0:69".to_string(),
            datastore: "/tftpboot".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"server_started\""));
    }
}
