//! End-to-end test utilities for the Culvert tunnel system
//!
//! Test harnesses for running the full server, real clients and a mock local
//! service in-process, with no external dependencies.

pub mod certificates;
pub mod harness;
pub mod mock_service;
pub mod test_client;

pub use certificates::TestCertificates;
pub use harness::{TestServer, TestServerOptions};
pub use mock_service::MockHttpService;
pub use test_client::{SilentClient, TestClient};
