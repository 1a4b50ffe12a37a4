//! Wire protocol: tagged control messages, framing, peer URLs

pub mod messages;
pub mod url;
pub mod wire;

pub use messages::ControlMessage;
pub use url::VarysUrl;
