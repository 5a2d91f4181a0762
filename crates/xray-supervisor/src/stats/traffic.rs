// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::stats::client::Counter;
use crate::stats::MetricKind;
use crate::CORE_API_TAG;

lazy_static! {
    static ref TAG_TRAFFIC_REGEX: Regex =
        Regex::new(r"^(inbound|outbound)>>>([^>]+)>>>traffic>>>(downlink|uplink)$")
            .expect("failed creating regex");
    static ref USER_TRAFFIC_REGEX: Regex =
        Regex::new(r"^user>>>([^>]+)>>>traffic>>>(downlink|uplink)$")
            .expect("failed creating regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn kind(self) -> MetricKind {
        match self {
            Direction::Inbound => MetricKind::Inbound,
            Direction::Outbound => MetricKind::Outbound,
        }
    }
}

/// Byte totals of one entity. Uplink counts as sent, downlink as received.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Traffic {
    pub sent: u64,
    pub received: u64,
}

impl Traffic {
    fn add(&mut self, link: &str, value: u64) {
        if link == "downlink" {
            self.received = self.received.saturating_add(value);
        } else {
            self.sent = self.sent.saturating_add(value);
        }
    }
}

/// Counters of one query, grouped per user and per (direction, tag).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrafficSample {
    pub users: HashMap<String, Traffic>,
    pub tags: HashMap<(Direction, String), Traffic>,
}

impl TrafficSample {
    /// Groups traffic counters by entity. Other counters and the core's own
    /// API inbound are ignored.
    pub fn from_counters(counters: &[Counter]) -> Self {
        let mut sample = Self::default();
        for counter in counters {
            if let Some(caps) = USER_TRAFFIC_REGEX.captures(&counter.name) {
                sample
                    .users
                    .entry(caps[1].to_string())
                    .or_default()
                    .add(&caps[2], counter.value);
                continue;
            }

            if let Some(caps) = TAG_TRAFFIC_REGEX.captures(&counter.name) {
                let tag = &caps[2];
                if tag == CORE_API_TAG {
                    continue;
                }
                let direction = if &caps[1] == "inbound" {
                    Direction::Inbound
                } else {
                    Direction::Outbound
                };
                sample
                    .tags
                    .entry((direction, tag.to_string()))
                    .or_default()
                    .add(&caps[3], counter.value);
            }
        }
        sample
    }
}
