//! Trace store: in-memory indexed representation of parsed replays plus a
//! payload-fingerprint lookup table. See SPEC_FULL.md §4.1.

pub mod model;
pub mod store;

pub use model::{
    ClientEvent, FlowKey, HeaderMap, OneResponse, Protocol, Replay,
    ResponseSet, ServerScript, TcpFlowScript, UdpEvent,
};
pub use store::{TraceStore, FINGERPRINT_SAMPLE_SIZE};
