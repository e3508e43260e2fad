//! Domain Layer
//!
//! Replicated entities, value objects, the ports the replication core
//! consumes and the services reacting to merged state.

pub mod entities;
pub mod ports;
pub mod services;
pub mod value_objects;
