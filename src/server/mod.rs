//! Server-side components: TCP flow server, UDP flow server, side-channel
//! server and admission control. See SPEC_FULL.md §4.3-§4.5.

pub mod admission;
pub mod session;
pub mod side_channel;
pub mod tcp;
pub mod udp;

pub use side_channel::ServerShared;
