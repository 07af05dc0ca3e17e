//! Session lifecycle and tool aggregation for Conduit.
//!
//! A [`Session`] is entered once per conversation. Entering connects every
//! enabled server concurrently; a server that fails is recorded and skipped,
//! never fatal to the session. The tools of the connected servers are merged
//! into a [`CapabilitySet`] that the agent runtime hands to the model.
//!
//! ```rust,ignore
//! use conduit_mcp::AdapterSet;
//! use conduit_session::{Session, SessionOptions};
//!
//! let session = Session::from_registry(&registry, AdapterSet::standard(), SessionOptions::default());
//! let report = session.enter().await?;
//! for server in report.failed() {
//!     eprintln!("{}: {}", server.name, server.last_error.as_deref().unwrap_or(""));
//! }
//! let result = session.invoke_tool("read_file", Some(json!({"path": "README.md"}))).await?;
//! session.exit().await?;
//! ```

pub mod aggregator;
pub mod error;
pub mod session;
pub mod status;

pub use aggregator::{CapabilitySet, ExposedTool, PREFIX_SEPARATOR, aggregate};
pub use error::{Result, SessionError};
pub use session::{Session, SessionOptions};
pub use status::{EnterReport, ServerStatus, SessionState};
