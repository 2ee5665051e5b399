//! Shelly Prometheus exporter: polls a fleet of Shelly relays, plugs, and
//! dimmers over their local JSON-RPC API and republishes their telemetry
//! as Prometheus metrics.
//!
//! This crate is organized leaf-first, one module per concern:
//! [`client`] talks to one device, [`driver`] turns its
//! JSON into normalized readings, [`metrics`] republishes those readings,
//! [`model`] holds the shared data model and live registry, [`config`]
//! loads and validates the YAML configuration, [`scheduler`] is the
//! polling engine's supervisor, [`watcher`] hot-reloads the config file,
//! [`discovery`] scans the LAN for new devices, and [`http`] serves
//! `/metrics` and `/health`.

pub mod client;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod http;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod watcher;
