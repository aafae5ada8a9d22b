//! HTTP API for creating and inspecting notification requests.
//!
//! Endpoints:
//! - GET  /health
//! - POST /notifications
//! - GET  /notifications
//! - GET  /notifications/{id}

pub mod routes;
pub mod state;
