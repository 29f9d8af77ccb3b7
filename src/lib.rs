//! paqet - TCP/UDP tunnel over raw-capture reliable-UDP
//!
//! # Architecture (Layered Data Plane)
//!
//! ```text
//! local socket / remote socket
//! → stream-copy engine (common::pipe)
//! → logical stream (carrier::mux)
//! → carrier session (carrier::kcp)
//! → raw packet connection + DPI evasion (packet)
//! → wire
//! ```
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing
//! - Errors stay inside their layer: a stream never kills its session,
//!   a session never kills the pool
//! - One root cancellation scope per role, bound to OS signals
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address, stream-copy engine
//! ├── packet/          # Raw capture send/recv, wire codec, DPI evasion
//! ├── carrier/         # KCP sessions + stream multiplexer
//! ├── protocol.rs      # In-band control/data frames
//! ├── client/          # Pool, health ticker, forwarders
//! ├── server/          # Accept/dispatch loop
//! └── license.rs       # Startup activation + binding cache
//! ```

// Core types
pub mod common;
pub mod error;

// Layered data plane
pub mod carrier;
pub mod packet;
pub mod protocol;

// Roles
pub mod client;
pub mod server;

// Supporting modules
pub mod config;
pub mod license;

// Re-exports for convenience
pub use common::Address;
pub use config::{Config, Role};
pub use error::{Error, Result};
