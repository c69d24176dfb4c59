//! Data transfer objects
//!
//! Request and response bodies of the server's HTTP interface.

pub mod job;
