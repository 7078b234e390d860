//! Network subsystem for mesh links

pub mod framing;
pub mod link;
pub mod tcp;

pub use framing::{encode_frame, read_frame};
pub use link::{Direction, LinkEvent, LinkId, PeerChannel};
pub use tcp::TcpTransport;
