//! Zentinel Service Mock
//!
//! Service virtualization: impersonates HTTP services and message-broker
//! participants from a declarative definition, so systems can be tested
//! without their real dependencies.
//!
//! # Features
//!
//! - **Request Matching**: Match by path, method, headers, query params, body
//! - **Response Sequences**: Multiple responses per endpoint, looped or sticky
//! - **Datasets**: Rows of template variables consumed one per interaction
//! - **Tags**: Select responses and rows out of band by tag
//! - **Performance Profiles**: Probabilistic delays and injected faults
//! - **Async Actors**: Scheduled producers, consumers, and relays on a broker
//!
//! # Example Configuration
//!
//! ```yaml
//! services:
//!   - type: http
//!     name: users
//!     port: 8001
//!     endpoints:
//!       - path: /users/{id}
//!         response:
//!           - {tag: first, body: {type: json, content: {id: "{{path.id}}"}}, template: true}
//!           - "user {{path.id}} is gone"
//!   - type: async
//!     broker: memory
//!     actors:
//!       - name: ticker
//!         delay_ms: 1000
//!         produce: {queue: ticks, value: "tick"}
//! ```

pub mod actor;
pub mod broker;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod http;
pub mod matcher;
pub mod performance;
pub mod render;
pub mod schema;
pub mod selector;
pub mod server;
pub mod template;

pub use broker::{BrokerMessage, BrokerTransport, MemoryBroker};
pub use config::MockConfig;
pub use engine::{EngineBuilder, MockEngine};
pub use error::{EngineError, Result};
pub use http::{HttpOutcome, MockRequest, MockResponse};
pub use server::MockServer;
