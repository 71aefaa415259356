pub mod command;
pub mod gate;
pub mod identity;
pub mod source;

pub use gate::{PeerGate, WgPeerGate};
pub use identity::{ClientDirIdentities, IdentityMap, LayeredIdentities, StaticIdentities};
pub use source::{CounterSource, WgDumpSource};
