/// Discovery: who else is on the LAN.
///
/// The broadcaster announces this instance on a timer, the listener servant
/// turns received announcements into directory updates.
pub mod broadcaster;
pub mod directory;
pub mod listener;

pub use broadcaster::{AnnounceSink, DiscoveryBroadcaster};
pub use directory::{AnnounceOutcome, PeerDirectory, PeerHandle};
pub use listener::DiscoveryServant;
