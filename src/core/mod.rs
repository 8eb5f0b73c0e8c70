//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Keystone:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Main runtime orchestration
//! - [`time`] - Citrusleaf-epoch clocks and LUT conversion
//! - [`error`] - Error types and wire result codes

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
