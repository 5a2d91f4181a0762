// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the core's `StatsService/QueryStats` call.

use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::errors::StatsError;

const QUERY_STATS_PATH: &str = "/xray.app.stats.command.StatsService/QueryStats";
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryStatsRequest {
    #[prost(string, tag = "1")]
    pub pattern: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: ::prost::alloc::vec::Vec<Stat>,
}

/// One named counter as reported by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub name: String,
    pub value: u64,
}

impl From<Stat> for Counter {
    fn from(stat: Stat) -> Self {
        Self {
            name: stat.name,
            value: u64::try_from(stat.value).unwrap_or_default(),
        }
    }
}

/// Anything that can read the core's counters.
#[async_trait]
pub trait CounterSource: Send + Sync {
    async fn query_counters(&self, reset: bool) -> Result<Vec<Counter>, StatsError>;
}

/// gRPC client for the core's management API. The connection is established
/// on first use and re-established after failures.
#[derive(Debug, Clone)]
pub struct XrayStatsClient {
    channel: Channel,
}

impl XrayStatsClient {
    pub fn new(addr: &str) -> Result<Self, StatsError> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|source| StatsError::Endpoint {
                addr: addr.to_string(),
                source,
            })?
            .timeout(CALL_TIMEOUT)
            .connect_timeout(CALL_TIMEOUT);
        Ok(Self {
            channel: endpoint.connect_lazy(),
        })
    }
}

#[async_trait]
impl CounterSource for XrayStatsClient {
    async fn query_counters(&self, reset: bool) -> Result<Vec<Counter>, StatsError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| StatsError::NotReady(e.to_string()))?;

        let request = tonic::Request::new(QueryStatsRequest {
            pattern: String::new(),
            reset,
        });
        let response: tonic::Response<QueryStatsResponse> = grpc
            .unary(
                request,
                PathAndQuery::from_static(QUERY_STATS_PATH),
                ProstCodec::default(),
            )
            .await?;

        let counters: Vec<Counter> = response
            .into_inner()
            .stat
            .into_iter()
            .map(Counter::from)
            .collect();
        debug!("Queried {} core counters", counters.len());
        Ok(counters)
    }
}
