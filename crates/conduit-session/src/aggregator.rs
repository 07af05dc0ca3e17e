//! Merging server catalogs into one capability set.
//!
//! Catalogs are merged in registry order. When two servers advertise the same
//! tool name the [`CollisionPolicy`] decides what the model sees:
//!
//! | policy       | exposed                                   |
//! |--------------|-------------------------------------------|
//! | `first_wins` | earlier server's tool, later ones dropped |
//! | `last_wins`  | later server's tool, earlier ones dropped |
//! | `prefix`     | `server__tool` for every colliding server |

use std::collections::HashMap;

use conduit_config::CollisionPolicy;
use conduit_mcp::ToolDescriptor;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Separator between server and tool in prefixed names.
pub const PREFIX_SEPARATOR: &str = "__";

/// A tool as exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposedTool {
    /// Name the model calls the tool by.
    pub name: String,
    /// The owning server's descriptor, with the server-side name.
    pub descriptor: ToolDescriptor,
}

/// Aggregated tools of every connected server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CapabilitySet {
    tools: Vec<ExposedTool>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    signature: String,
}

impl CapabilitySet {
    /// The empty set.
    pub fn empty() -> Self {
        Self {
            signature: signature_of(std::iter::empty()),
            ..Self::default()
        }
    }

    /// Look up a tool by its exposed name.
    pub fn resolve(&self, name: &str) -> Option<&ExposedTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Exposed tools in registry order.
    pub fn tools(&self) -> &[ExposedTool] {
        &self.tools
    }

    /// Exposed tools owned by `server`.
    pub fn tools_for<'a>(&'a self, server: &'a str) -> impl Iterator<Item = &'a ExposedTool> {
        self.tools
            .iter()
            .filter(move |t| t.descriptor.server == server)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Hex SHA-256 over the sorted `server/tool` pairs of the exposed tools.
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// Merge `catalogs` (one per connected server, in registry order).
pub fn aggregate(catalogs: &[(String, Vec<ToolDescriptor>)], policy: CollisionPolicy) -> CapabilitySet {
    let mut owners: HashMap<&str, Vec<&str>> = HashMap::new();
    for (server, tools) in catalogs {
        for tool in tools {
            let servers = owners.entry(tool.name.as_str()).or_default();
            if !servers.contains(&server.as_str()) {
                servers.push(server.as_str());
            }
        }
    }

    let mut tools: Vec<ExposedTool> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (server, catalog) in catalogs {
        for tool in catalog {
            let holders = owners.get(tool.name.as_str()).map(Vec::as_slice).unwrap_or_default();
            let colliding = holders.len() > 1;

            let exposed = match policy {
                _ if !colliding => tool.name.clone(),
                CollisionPolicy::Prefix => format!("{}{}{}", server, PREFIX_SEPARATOR, tool.name),
                CollisionPolicy::FirstWins => {
                    if holders.first().copied() != Some(server.as_str()) {
                        tracing::warn!(
                            tool = %tool.name,
                            server = %server,
                            kept = holders.first().copied().unwrap_or_default(),
                            "tool name collision, dropping later server's tool"
                        );
                        continue;
                    }
                    tool.name.clone()
                }
                CollisionPolicy::LastWins => {
                    if holders.last().copied() != Some(server.as_str()) {
                        tracing::warn!(
                            tool = %tool.name,
                            server = %server,
                            kept = holders.last().copied().unwrap_or_default(),
                            "tool name collision, dropping earlier server's tool"
                        );
                        continue;
                    }
                    tool.name.clone()
                }
            };

            // A server listing the same tool twice keeps its first entry.
            if index.contains_key(&exposed) {
                continue;
            }
            index.insert(exposed.clone(), tools.len());
            tools.push(ExposedTool {
                name: exposed,
                descriptor: tool.clone(),
            });
        }
    }

    let signature = signature_of(tools.iter().map(|t| t.descriptor.qualified_name()));
    CapabilitySet {
        tools,
        index,
        signature,
    }
}

fn signature_of(pairs: impl Iterator<Item = String>) -> String {
    let mut pairs: Vec<String> = pairs.collect();
    pairs.sort_unstable();

    let mut hasher = Sha256::new();
    for pair in &pairs {
        hasher.update(pair.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
