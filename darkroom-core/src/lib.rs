//! Darkroom Core
//!
//! Core types shared by the Darkroom job engine, its server, client and CLI.
//!
//! This crate contains:
//! - Domain types: jobs, payloads, remote instances, alerts, metrics
//! - DTOs: request/response shapes for the outward HTTP interface

pub mod domain;
pub mod dto;
