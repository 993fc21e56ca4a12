//! Defines the interface between devices and the code that knows how
//! to talk to them.
//!
//! A `Handler` is a named bundle of optional operations shared by
//! every device of a kind: how to read one device, how to read all of
//! the handler's devices in one pass, how to write, and how to listen
//! for spontaneous events. A plugin registers its handlers once and
//! device configuration refers to them by name.
//!
//! Capability is a runtime predicate over which operations are
//! present. A device is readable if its handler has any of read,
//! bulk read, or listen; writable if it has write. There is no
//! trait hierarchy to implement; each operation is a function the
//! plugin author supplies.

use crate::types::{ReadContext, Reading, WriteData};
use crate::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::device::Device;

/// The future type handler operations return. Boxing keeps the
/// handler table homogeneous; the scheduler never needs to know the
/// concrete future type.
pub type Fut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Reads one device, returning its current readings.
pub type ReadFn =
    Box<dyn Fn(Arc<Device>) -> Fut<Result<Vec<Reading>>> + Send + Sync>;

/// Reads every device of the handler in a single pass. Handlers for
/// hardware with a shared bus or connection implement this instead of
/// `ReadFn` so one round-trip serves all devices.
pub type BulkReadFn = Box<
    dyn Fn(Vec<Arc<Device>>) -> Fut<Result<Vec<ReadContext>>> + Send + Sync,
>;

/// Applies a write to one device.
pub type WriteFn =
    Box<dyn Fn(Arc<Device>, WriteData) -> Fut<Result<()>> + Send + Sync>;

/// Long-running listener for devices that push events. The handler
/// sends batches into the provided channel; returning (with or
/// without an error) makes the scheduler restart it with backoff.
pub type ListenFn = Box<
    dyn Fn(Arc<Device>, mpsc::Sender<ReadContext>) -> Fut<Result<()>>
        + Send
        + Sync,
>;

pub struct Handler {
    name: String,
    read: Option<ReadFn>,
    bulk_read: Option<BulkReadFn>,
    write: Option<WriteFn>,
    listen: Option<ListenFn>,
    actions: Vec<String>,
}

impl Handler {
    /// Creates a handler with no operations. Chain `with_*` calls to
    /// give it capabilities.
    pub fn new(name: &str) -> Handler {
        Handler {
            name: name.into(),
            read: None,
            bulk_read: None,
            write: None,
            listen: None,
            actions: vec![],
        }
    }

    pub fn with_read<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut<Result<Vec<Reading>>> + Send + Sync + 'static,
    {
        self.read = Some(Box::new(f));
        self
    }

    pub fn with_bulk_read<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Arc<Device>>) -> Fut<Result<Vec<ReadContext>>>
            + Send
            + Sync
            + 'static,
    {
        self.bulk_read = Some(Box::new(f));
        self
    }

    pub fn with_write<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>, WriteData) -> Fut<Result<()>> + Send + Sync + 'static,
    {
        self.write = Some(Box::new(f));
        self
    }

    pub fn with_listen<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>, mpsc::Sender<ReadContext>) -> Fut<Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.listen = Some(Box::new(f));
        self
    }

    /// Declares the write actions this handler accepts. An empty list
    /// (the default) accepts any action.
    pub fn with_actions(mut self, actions: &[&str]) -> Self {
        self.actions = actions.iter().map(|v| String::from(*v)).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn has_read(&self) -> bool {
        self.read.is_some()
    }

    pub fn has_bulk_read(&self) -> bool {
        self.bulk_read.is_some()
    }

    pub fn has_listen(&self) -> bool {
        self.listen.is_some()
    }

    pub fn is_readable(&self) -> bool {
        self.read.is_some() || self.bulk_read.is_some() || self.listen.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.write.is_some()
    }

    /// Checks a write action against the declared list. An empty
    /// declaration accepts everything.
    pub fn action_allowed(&self, action: &str) -> bool {
        self.actions.is_empty()
            || self.actions.iter().any(|v| v == action)
    }

    /// Invokes the read operation, if present.
    pub fn read(&self, device: &Arc<Device>) -> Option<Fut<Result<Vec<Reading>>>> {
        self.read.as_ref().map(|f| f(device.clone()))
    }

    /// Invokes the bulk-read operation, if present.
    pub fn bulk_read(
        &self,
        devices: Vec<Arc<Device>>,
    ) -> Option<Fut<Result<Vec<ReadContext>>>> {
        self.bulk_read.as_ref().map(|f| f(devices))
    }

    /// Invokes the write operation, if present.
    pub fn write(
        &self,
        device: &Arc<Device>,
        data: WriteData,
    ) -> Option<Fut<Result<()>>> {
        self.write.as_ref().map(|f| f(device.clone(), data))
    }

    /// Invokes the listen operation, if present.
    pub fn listen(
        &self,
        device: &Arc<Device>,
        sink: mpsc::Sender<ReadContext>,
    ) -> Option<Fut<Result<()>>> {
        self.listen.as_ref().map(|f| f(device.clone(), sink))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("read", &self.read.is_some())
            .field("bulk_read", &self.bulk_read.is_some())
            .field("write", &self.write.is_some())
            .field("listen", &self.listen.is_some())
            .field("actions", &self.actions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;

    #[test]
    fn test_capabilities() {
        let h = Handler::new("empty");

        assert_eq!(h.name(), "empty");
        assert!(!h.is_readable());
        assert!(!h.is_writable());

        let h = Handler::new("ro")
            .with_read(|_| Box::pin(async { Ok(vec![Reading::new(1i32)]) }));

        assert!(h.is_readable());
        assert!(h.has_read());
        assert!(!h.has_bulk_read());
        assert!(!h.is_writable());

        let h = Handler::new("bulk")
            .with_bulk_read(|_| Box::pin(async { Ok(vec![]) }));

        assert!(h.is_readable());

        let h = Handler::new("push")
            .with_listen(|_, _| Box::pin(async { Ok(()) }));

        assert!(h.is_readable());
        assert!(h.has_listen());

        let h = Handler::new("wo")
            .with_write(|_, _| Box::pin(async { Ok(()) }));

        assert!(!h.is_readable());
        assert!(h.is_writable());
    }

    #[test]
    fn test_action_allowed() {
        let h = Handler::new("any");

        assert!(h.action_allowed("whatever"));

        let h = Handler::new("lock").with_actions(&["lock", "unlock"]);

        assert!(h.action_allowed("lock"));
        assert!(h.action_allowed("unlock"));
        assert!(!h.action_allowed("open"));
        assert!(!h.action_allowed(""));
    }

    #[tokio::test]
    async fn test_invocation() {
        let h = Handler::new("fail").with_bulk_read(|devices| {
            Box::pin(async move {
                if devices.is_empty() {
                    Err(Error::Handler("no devices".into()))
                } else {
                    Ok(vec![])
                }
            })
        });

        assert!(h.bulk_read(vec![]).unwrap().await.is_err());

        // Missing operations yield no future at all.

        assert!(h.read(&crate::device::tests::test_device()).is_none());
    }
}
