/*!
Development support for the pifleet workspace.

Lets coordinator and agent protocol logic be exercised without a running
MQTT broker:
- In-memory message bus with topic wildcard matching and message capture
- Builders for the wire messages exchanged on the bus
*/

pub mod bus_stub;
pub mod messages;

pub use bus_stub::{BusMessage, MemoryBus};
pub use messages::MessageBuilder;

/// Init logging for tests (safe to call multiple times).
pub fn init_test_logging() {
    env_logger::try_init().ok();
}
