use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

use crate::action::{DispatchOptions, DispatchPolicy};
use crate::channels::DEFAULT_CAPACITY;
use crate::delivery::Delivery;

/// Store settings that can come from the environment or a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dedupe_states: bool,
    pub channel_capacity: usize,
    pub delivery: Delivery,
    /// Options for actions emitted by middleware.
    pub redispatch: DispatchOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dedupe_states: true,
            channel_capacity: DEFAULT_CAPACITY,
            delivery: Delivery::default(),
            redispatch: DispatchOptions::default(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<L>(lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let dedupe_states = match lookup("RECOMBINE_DEDUPE_STATES") {
            Some(value) => value
                .trim()
                .parse()
                .context("RECOMBINE_DEDUPE_STATES must be true or false")?,
            None => defaults.dedupe_states,
        };
        let channel_capacity = match lookup("RECOMBINE_CHANNEL_CAPACITY") {
            Some(value) => value
                .trim()
                .parse()
                .context("RECOMBINE_CHANNEL_CAPACITY must be a valid number")?,
            None => defaults.channel_capacity,
        };
        if channel_capacity == 0 {
            bail!("RECOMBINE_CHANNEL_CAPACITY must be at least 1");
        }
        let delivery = match lookup("RECOMBINE_DELIVERY") {
            Some(value) => parse_delivery(&value).context("RECOMBINE_DELIVERY is invalid")?,
            None => defaults.delivery,
        };
        let policy = match lookup("RECOMBINE_REDISPATCH_POLICY") {
            Some(value) => parse_policy(&value).context("RECOMBINE_REDISPATCH_POLICY is invalid")?,
            None => defaults.redispatch.policy,
        };
        let collect = match lookup("RECOMBINE_REDISPATCH_COLLECT") {
            Some(value) => value
                .trim()
                .parse()
                .context("RECOMBINE_REDISPATCH_COLLECT must be true or false")?,
            None => defaults.redispatch.collect,
        };

        Ok(Self {
            dedupe_states,
            channel_capacity,
            delivery,
            redispatch: DispatchOptions { policy, collect },
        })
    }
}

fn parse_delivery(value: &str) -> Result<Delivery> {
    match value.trim().to_ascii_lowercase().as_str() {
        "immediate" => Ok(Delivery::Immediate),
        "dedicated" => Ok(Delivery::Dedicated),
        other => bail!("unknown delivery {other:?}, expected immediate or dedicated"),
    }
}

fn parse_policy(value: &str) -> Result<DispatchPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "serial" => Ok(DispatchPolicy::Serial),
        "concurrent" => Ok(DispatchPolicy::Concurrent),
        other => bail!("unknown dispatch policy {other:?}, expected serial or concurrent"),
    }
}
