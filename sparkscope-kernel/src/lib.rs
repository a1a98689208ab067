//! Sparkscope kernel: MQTT broker discovery, multi-broker sessions and a
//! Sparkplug B metric tree, wired together through a typed event bus.

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod health;
pub mod probe;
pub mod session;
pub mod sparkplug;
pub mod state;
pub mod topic;
pub mod tree;

pub use discovery::{BrokerDescriptor, DiscoveryEngine, DiscoveryOptions};
pub use error::{DecodeError, DiscoveryError, ErrorKind, SessionError, TransportError};
pub use events::{EventBus, KernelEvent};
pub use probe::{HandshakeProbe, ProbeResult};
pub use session::{SessionConfig, SessionManager, SessionState};
pub use topic::{SparkplugTopic, TopicParser};
pub use tree::MetricTree;
