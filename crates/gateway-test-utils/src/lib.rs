//! # Gateway Test Utilities
//!
//! Mocks and fixtures for exercising the camera gateway without cameras, a
//! control server or a database.
//!
//! ## Modules
//!
//! - `mock_conductor` - scriptable media engine with gated probes
//! - `memory_store` - in-memory device store with failure injection
//! - `fake_dialer` - in-process control/signaling server ends
//! - `eventual` - polling helpers for asynchronous conditions
//! - `fixtures` - configuration, records and a gateway harness
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_test_utils::*;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn test_example() {
//!     let store = MemoryStore::new().with_device(camera("cam1"));
//!     let conductor = MockConductor::new().with_report("cam1", online_report());
//!     let harness = TestContext::new(store, conductor);
//!     let gateway = harness.start().await;
//!
//!     let mut server = harness.dialer.next_socket().await.unwrap();
//!     // ... drive the gateway through `server` ...
//! }
//! ```

pub mod eventual;
pub mod fake_dialer;
pub mod fixtures;
pub mod memory_store;
pub mod mock_conductor;

pub use eventual::{assert_eventually, wait_until};
pub use fake_dialer::{FakeDialer, FakeSocket};
pub use fixtures::*;
pub use memory_store::MemoryStore;
pub use mock_conductor::{MockConductor, MockPeer};
