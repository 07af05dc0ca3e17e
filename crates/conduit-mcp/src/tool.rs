//! Transport-tagged tool descriptors and connection status.

use std::fmt;

use conduit_config::TransportKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::ToolInfo;

/// A tool advertised by a connected server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as the server knows it.
    pub name: String,
    /// Owning server.
    pub server: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
    /// Transport the owning server is reached over.
    pub transport: TransportKind,
}

impl ToolDescriptor {
    /// Build from a `tools/list` entry.
    pub fn from_info(info: ToolInfo, server: &str, transport: TransportKind) -> Self {
        Self {
            name: info.name,
            server: server.to_string(),
            description: info.description.unwrap_or_default(),
            input_schema: info
                .input_schema
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
            transport,
        }
    }

    /// Stable `server/tool` identity.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.server, self.name)
    }
}

/// Live state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_info_defaults_schema() {
        let info = ToolInfo {
            name: "ping".into(),
            description: None,
            input_schema: None,
        };
        let tool = ToolDescriptor::from_info(info, "alpha", TransportKind::Stdio);
        assert_eq!(tool.qualified_name(), "alpha/ping");
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.description.is_empty());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&ConnectionStatus::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
        assert_eq!(ConnectionStatus::Error.to_string(), "error");
    }
}
