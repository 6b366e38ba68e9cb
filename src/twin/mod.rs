//! Device-twin synchronization: property mirror, command routing, and the
//! cloud connection session.

pub mod commands;
pub mod properties;
pub mod session;

pub use commands::{CommandName, CommandRouter};
pub use properties::{Property, PropertySource, PropertyStore, PropertyUplink};
pub use session::{ConnectionSession, SessionState};
