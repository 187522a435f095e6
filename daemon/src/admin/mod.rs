//! Administrative surface: request/reply messages over a channel pair.

pub mod protocol;
pub mod service;

pub use protocol::{AdminReply, AdminRequest, NewRule};
pub use service::{admin_channel, AdminCommand, AdminHandle, AdminService};
