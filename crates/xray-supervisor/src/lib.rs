// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Supervisor and control plane for an Xray proxy core.
//!
//! The [`supervisor::CoreManager`] keeps one core process alive through the
//! [`dispatcher::XrayDispatcher`], which feeds it the document held by the
//! [`config_store::FileConfigStore`] and splits its stdout between the access
//! and core [`sinks`]. Traffic counters are sampled by the [`stats`] module and
//! everything is exposed to a transport through [`handlers::ManagementHandlers`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod config_store;
pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod sinks;
pub mod stats;
pub mod supervisor;
pub mod tail;

/// Address the core's management API listens on.
pub const CORE_API_LISTEN: &str = "127.0.0.1:3000";

/// Services enabled on the core's management API.
pub const CORE_API_SERVICES: [&str; 4] = [
    "HandlerService",
    "LoggerService",
    "StatsService",
    "RoutingService",
];

/// Inbound tag of the core's management API, excluded from traffic stats.
pub const CORE_API_TAG: &str = "api";
