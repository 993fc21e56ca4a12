//! The RPC service surface.
//!
//! Transport-agnostic: this module implements the operations the
//! plugin serves (device queries, reads, streams, writes,
//! transactions), while the wire layer that frames them onto a
//! socket is an external collaborator. Streaming results are plain
//! `Stream`s; dropping one cancels it cleanly.

use crate::config::NetworkConfig;
use crate::device::{DeviceManager, Selector};
use crate::meta::{HealthStatus, PluginMetadata, VersionInfo};
use crate::scheduler::Scheduler;
use crate::state::StateManager;
use crate::transaction::Cache;
use chrono::{DateTime, Utc};
use manifold_api::{
    device::Device,
    types::tag::Tag,
    types::transaction::Transaction as TransactionSnapshot,
    types::{Reading, WriteData},
    Error, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_stream::{
    self as stream,
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::warn;

pub use manifold_api::types::DataStream;

/// A device as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSummary {
    pub id: String,
    pub alias: Option<String>,
    pub device_type: String,
    pub plugin: String,
    pub info: String,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
    pub outputs: Vec<String>,
    pub capabilities: Capabilities,
    pub sort_index: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    /// "r", "w", or "rw".
    pub mode: String,
    pub write_actions: Vec<String>,
}

impl DeviceSummary {
    fn from_device(device: &Device, plugin: &str) -> DeviceSummary {
        DeviceSummary {
            id: device.id.clone(),
            alias: device.alias.clone(),
            device_type: device.device_type.clone(),
            plugin: plugin.into(),
            info: device.info.clone(),
            metadata: device.context.clone(),
            tags: device.tags.iter().map(|v| v.to_string()).collect(),
            outputs: device.output.iter().cloned().collect(),
            capabilities: Capabilities {
                mode: device.capability_mode().into(),
                write_actions: device.handler.actions().to_vec(),
            },
            sort_index: device.sort_index,
            timestamp: Utc::now(),
        }
    }
}

/// Builds a selector from its wire parts.
pub fn selector(id: &str, tags: &[(&str, &str, &str)]) -> Result<Selector> {
    let tags = tags
        .iter()
        .map(|(ns, ann, label)| Tag::from_parts(ns, ann, label))
        .collect::<Result<Vec<Tag>>>()?;

    Ok(Selector {
        id: id.into(),
        tags,
    })
}

pub struct PluginService {
    metadata: PluginMetadata,
    version: VersionInfo,
    network: NetworkConfig,
    devices: Arc<DeviceManager>,
    state: Arc<StateManager>,
    scheduler: Arc<Scheduler>,
    transactions: Arc<Cache>,
    healthy: Arc<AtomicBool>,
}

impl PluginService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: PluginMetadata,
        version: VersionInfo,
        network: NetworkConfig,
        devices: Arc<DeviceManager>,
        state: Arc<StateManager>,
        scheduler: Arc<Scheduler>,
        transactions: Arc<Cache>,
        healthy: Arc<AtomicBool>,
    ) -> PluginService {
        PluginService {
            metadata,
            version,
            network,
            devices,
            state,
            scheduler,
            transactions,
            healthy,
        }
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    /// The listening address and TLS material for the wire layer.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn health(&self) -> HealthStatus {
        if self.healthy.load(Ordering::Relaxed) {
            HealthStatus::Ok
        } else {
            HealthStatus::Unknown
        }
    }

    /// Reachability probe.
    pub fn test(&self) -> bool {
        true
    }

    // Resolves a selector, distinguishing an explicit id that
    // matches nothing (not-found) from a tag query with an empty
    // result (fine, empty).

    fn select(&self, selector: &Selector) -> Result<Vec<Arc<Device>>> {
        let found = self.devices.get_devices(selector);

        if found.is_empty() && !selector.id.is_empty() {
            Err(Error::NotFound)
        } else {
            Ok(found)
        }
    }

    /// Streams the devices a selector matches. An empty selector
    /// yields every device.
    pub fn devices(&self, selector: &Selector) -> Result<DataStream<DeviceSummary>> {
        let plugin = self.metadata.tag();
        let summaries: Vec<DeviceSummary> = self
            .select(selector)?
            .iter()
            .map(|dev| DeviceSummary::from_device(dev, &plugin))
            .collect();

        Ok(Box::pin(stream::iter(summaries)))
    }

    /// Streams the current latest readings of the selected devices.
    pub fn read(&self, selector: &Selector) -> Result<DataStream<Reading>> {
        let mut readings = vec![];

        for device in self.select(selector)? {
            readings.extend(self.state.get_readings(&device.id))
        }
        Ok(Box::pin(stream::iter(readings)))
    }

    /// Streams readings from the windowed cache. When the cache is
    /// disabled this degrades to the current latest readings of all
    /// devices.
    pub fn read_cache(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> DataStream<Reading> {
        let readings = match self.state.cached_between(start, end) {
            Some(cached) => cached,
            None => {
                warn!("reading cache is disabled; serving current readings");
                self.state
                    .get_all_readings()
                    .into_values()
                    .flatten()
                    .collect()
            }
        };

        Box::pin(stream::iter(readings))
    }

    /// Streams future readings of the selected devices as they
    /// arrive. Dropping the stream unsubscribes.
    pub fn read_stream(&self, selector: &Selector) -> Result<DataStream<Reading>> {
        let filter: Option<HashSet<String>> =
            if selector.id.is_empty() && selector.tags.is_empty() {
                None
            } else {
                Some(
                    self.select(selector)?
                        .iter()
                        .map(|dev| dev.id.clone())
                        .collect(),
                )
            };

        let rx = self.state.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |entry| {
            match entry {
                Ok(reading) => match &filter {
                    Some(ids) if !ids.contains(&reading.device) => None,
                    _ => Some(reading),
                },
                // A slow consumer misses readings rather than
                // stalling the pipeline; that's worth a log line but
                // not an error on the stream.
                Err(BroadcastStreamRecvError::Lagged(count)) => {
                    warn!("read stream lagged; missed {} readings", count);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }

    /// Accepts writes for a single device and returns one
    /// transaction per payload. The writes execute asynchronously;
    /// callers poll the transactions.
    pub async fn write(
        &self,
        selector: &Selector,
        data: Vec<WriteData>,
    ) -> Result<Vec<TransactionSnapshot>> {
        if selector.id.is_empty() {
            return Err(Error::InvArgument(
                "write requires a device id or alias".into(),
            ));
        }
        if data.is_empty() {
            return Err(Error::InvArgument("no write data provided".into()));
        }

        let device = self
            .devices
            .get_device(&selector.id)
            .ok_or(Error::NotFound)?;

        if !device.is_writable() {
            return Err(Error::UnsupportedCommand(format!(
                "device {} is not writable",
                device.id
            )));
        }

        // Validate the whole batch before enqueueing any of it, so a
        // bad action doesn't leave a half-accepted write behind.

        for item in &data {
            if !device.handler.action_allowed(&item.action) {
                return Err(Error::InvArgument(format!(
                    "action \"{}\" is not supported by handler \"{}\"",
                    item.action,
                    device.handler.name()
                )));
            }
        }

        let mut accepted = Vec::with_capacity(data.len());

        for item in data {
            let txn = self.transactions.create();

            self.scheduler
                .enqueue_write(device.clone(), item, txn.clone())
                .await?;
            accepted.push(txn.snapshot())
        }
        Ok(accepted)
    }

    /// Looks up a transaction. Unknown and expired ids are both
    /// not-found.
    pub fn transaction(&self, id: &str) -> Result<TransactionSnapshot> {
        self.transactions
            .get(id)
            .map(|txn| txn.snapshot())
            .ok_or(Error::NotFound)
    }

    /// Streams the ids of all live transactions.
    pub fn transactions(&self) -> DataStream<String> {
        Box::pin(stream::iter(self.transactions.ids()))
    }
}
