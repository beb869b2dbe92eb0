//! Shared test utilities for the ingestion crates
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//!
//! # Usage
//!
//! Add `features = ["nats"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::TestNats;
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     nats.create_stream("github", &["github.>"]).await;
//!     let sequence = nats.publish("github.acme.api.push", "{}").await;
//!     assert_eq!(sequence, 1);
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;
