/*
 * 5D Labs Countermeasure - Alert-driven Remediation for Kubernetes
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Countermeasure core library
//!
//! Alert producers poll Prometheus and publish events on an in-process bus.
//! The action manager routes each event to the `CounterMeasure` policies
//! listening for it and runs their remediation actions against the cluster.

pub mod action;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod controllers;
pub mod crds;
pub mod error;
pub mod event;
pub mod manager;
pub mod metrics;
pub mod producer;
pub mod recorder;

// Re-export commonly used types
pub use bus::{Bus, BusConfig, Consumer};
pub use config::ControllerConfig;
pub use crds::{CounterMeasure, CounterMeasureSpec, PrometheusSource, PrometheusSourceSpec};
pub use error::{Error, Result};
pub use event::{Event, ObjectKey};
pub use manager::ActionManager;
pub use producer::ProducerManager;

#[cfg(test)]
mod tests;
