/*!
# Sparkscope DevKit

Test support for code built on the Sparkscope kernel:
- an in-memory MQTT transport that scripts broker behaviour
- builders for Sparkplug B payloads and topics
- a harness that waits on kernel events, and a fake broker for probe tests
*/

pub mod mock_transport;
pub mod payload_builders;
pub mod test_utils;

pub use mock_transport::{MockConnector, MockTransport, RecordedPublish};
pub use payload_builders::{topic, SparkplugPayloadBuilder};
pub use test_utils::{FakeBroker, TestHarness};
