//! # 🐕 Cerberus
//!
//! Keeps a Let's Encrypt certificate for a single server alive. Keys and the ACME account are
//! created on first use, certificates are ordered through HTTP-01 challenges served from a short
//! lived HTTP server and renewed before they run out.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, clippy::all, clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod account;
pub mod acme;
pub mod challenge;
pub mod csr;
pub mod error;
pub mod keys;
pub mod manager;
pub mod order;
pub mod responder;
pub mod scheduler;
pub mod services;
pub mod settings;
pub mod validator;

pub use crate::{manager::CertManager, settings::Settings};
