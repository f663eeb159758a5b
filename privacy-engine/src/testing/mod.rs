//! Testing utilities for the privacy engine.
//!
//! This module provides:
//! - An in-memory connector with a call log and scripted failures
//! - Fault-injecting stores that simulate crashed processes
//! - A scripted webhook client and a local mock HTTP server
//! - Sample datasets, policies and rows

mod fixtures;
#[cfg(feature = "http")]
mod http;
mod mocks;

pub use fixtures::{
    access_policy, customer_orders_dataset, customer_rows, email_identity, erasure_policy, null_email_erasure_policy,
    order_rows, row, SAMPLE_CONNECTION, SAMPLE_DATASET,
};
#[cfg(feature = "http")]
pub use http::{MockHttpServer, MockRoute, RecordedRequest};
pub use mocks::{
    CallPhase, ConnectorCall, FaultInjectingRequestStore, FaultInjectingTaskStore, InMemoryConnector,
    RecordingWebhookClient,
};
