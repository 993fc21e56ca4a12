//! The runtime device type.
//!
//! A `Device` is assembled by the device manager from one prototype
//! and one instance of declarative configuration. After construction
//! it never changes; everything the scheduler and RPC surface need is
//! resolved up front, including the deterministic id, the merged data
//! map, and the full tag set.

use crate::handler::Handler;
use crate::transform::Transform;
use crate::types::tag::Tag;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Bounds a write handler invocation when neither the prototype, the
/// instance, nor the plugin configuration sets a timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Device {
    /// Deterministic id, stable across restarts for the same
    /// configuration on the same plugin.
    pub id: String,

    /// The string the id is hashed from. Kept for diagnostics.
    pub id_name: String,

    pub device_type: String,

    /// Human-oriented description of the device.
    pub info: String,

    pub handler: Arc<Handler>,

    /// Protocol-specific data, deep-merged from prototype and
    /// instance. Only the handler interprets it.
    pub data: toml::value::Table,

    /// Merged free-form context attached to every reading's device.
    pub context: HashMap<String, String>,

    /// Configured tags plus the generated `system/id` and
    /// `system/type` tags.
    pub tags: Vec<Tag>,

    pub alias: Option<String>,

    pub sort_index: i32,

    /// Applied to each reading in order.
    pub transforms: Vec<Transform>,

    pub write_timeout: Duration,

    /// Name of the reading kind stamped onto readings the handler
    /// leaves untyped.
    pub output: Option<String>,

    /// Serializes writes; the scheduler holds this for the duration
    /// of each `handler.write` call.
    pub write_lock: Mutex<()>,
}

impl Device {
    pub fn is_readable(&self) -> bool {
        self.handler.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.handler.is_writable()
    }

    /// The capability mode exposed on the wire: "r", "w", "rw", or
    /// empty for a device whose handler can't do either.
    pub fn capability_mode(&self) -> &'static str {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => "rw",
            (true, false) => "r",
            (false, true) => "w",
            (false, false) => "",
        }
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    /// Takes the device's write lock. At most one write handler call
    /// runs per device at a time.
    pub async fn lock_for_write(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("type", &self.device_type)
            .field("handler", &self.handler.name())
            .field("alias", &self.alias)
            .field("tags", &self.tags)
            .finish()
    }
}
