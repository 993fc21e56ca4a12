//! The device manager.
//!
//! Builds devices from static and dynamically registered
//! configuration, enforces the identity invariants (unique ids,
//! unique aliases, resolvable handlers), and serves selector queries
//! for the rest of the runtime. All writes happen during startup,
//! before the scheduler runs; afterwards the manager is shared
//! immutably and every lookup is lock-free.

use crate::config::{DeviceConfig, DynamicRegistration};
use crate::glob::Pattern;
use crate::output::{self, Output};
use async_trait::async_trait;
use manifold_api::{
    device::Device,
    handler::Handler,
    types::{tag::Tag, MultiError},
    Error, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub mod builder;
pub mod tags;

pub use builder::Builder;
use tags::TagCache;

/// Produces additional device prototypes at startup, one call per
/// entry of the plugin's `dynamic_registration.config` list.
pub type DynamicConfigRegistrar = Box<
    dyn Fn(&toml::value::Table) -> Result<Vec<crate::config::DeviceProto>>
        + Send
        + Sync,
>;

/// Produces fully built devices at startup, one call per entry of
/// the `dynamic_registration.config` list. The provided builder ties
/// the devices to the plugin's namespace and handler table.
pub type DynamicDeviceRegistrar = Box<
    dyn Fn(&toml::value::Table, &Builder) -> Result<Vec<Device>> + Send + Sync,
>;

/// Plugin-supplied check run over each device's data map before the
/// device is accepted.
pub type DeviceDataValidator =
    Box<dyn Fn(&toml::value::Table) -> Result<()> + Send + Sync>;

/// What to do when dynamic registration fails or comes up empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPolicy {
    /// Failures are logged and discarded.
    Optional,
    /// Any failure, or zero devices produced, fails startup.
    Required,
}

impl RegistrationPolicy {
    /// Parses the configured policy string. Anything other than the
    /// two known policies is fatal; a policy that can't be enforced
    /// must not be silently reinterpreted.
    pub fn from_config(s: &str) -> Result<RegistrationPolicy> {
        match s {
            "" | "optional" => Ok(RegistrationPolicy::Optional),
            "required" => Ok(RegistrationPolicy::Required),
            v => Err(Error::Config(format!(
                "unknown dynamic registration policy \"{}\"",
                v
            ))),
        }
    }
}

/// A plugin-registered action run once per matching device after the
/// manager is assembled and before the scheduler starts.
#[async_trait]
pub trait DeviceAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, device: &Arc<Device>) -> Result<()>;
}

/// Pairs a device action with the filter selecting the devices it
/// applies to. The filter maps a field name to glob patterns; a
/// device matches when every field matches at least one of its
/// patterns. An empty filter matches nothing.
pub struct DeviceSetupAction {
    pub filter: HashMap<String, Vec<String>>,
    pub action: Arc<dyn DeviceAction>,
}

const FILTER_FIELDS: &[&str] = &["type", "handler", "id"];

impl DeviceSetupAction {
    /// Rejects filters naming unsupported fields.
    pub fn validate(&self) -> Result<()> {
        for field in self.filter.keys() {
            if !FILTER_FIELDS.contains(&field.as_str()) {
                return Err(Error::Config(format!(
                    "device setup action \"{}\" filters on unknown field \"{}\"",
                    self.action.name(),
                    field
                )));
            }
        }
        Ok(())
    }

    fn matches(&self, device: &Device) -> bool {
        !self.filter.is_empty()
            && self.filter.iter().all(|(field, patterns)| {
                let value = match field.as_str() {
                    "type" => &device.device_type,
                    "handler" => device.handler.name(),
                    "id" => &device.id,
                    _ => return false,
                };

                patterns
                    .iter()
                    .any(|p| Pattern::create(p).matches(value))
            })
    }
}

pub struct DeviceManager {
    namespace: Uuid,
    handlers: HashMap<String, Arc<Handler>>,
    outputs: HashMap<String, Output>,
    devices: HashMap<String, Arc<Device>>,
    aliases: HashMap<String, Arc<Device>>,
    tags: TagCache,
    validator: Option<DeviceDataValidator>,
}

impl DeviceManager {
    /// Creates a manager seeded with the built-in output types.
    pub fn new(namespace: Uuid) -> DeviceManager {
        DeviceManager {
            namespace,
            handlers: HashMap::new(),
            outputs: output::builtins()
                .into_iter()
                .map(|o| (o.name.clone(), o))
                .collect(),
            devices: HashMap::new(),
            aliases: HashMap::new(),
            tags: TagCache::new(),
            validator: None,
        }
    }

    pub fn namespace(&self) -> Uuid {
        self.namespace
    }

    /// Registers a handler devices can refer to by name. Handler
    /// names must be unique.
    pub fn register_handler(&mut self, handler: Handler) -> Result<()> {
        let name = String::from(handler.name());

        if self.handlers.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("handler \"{}\"", name)));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Registers an output type devices can name. The built-in set
    /// is pre-registered; names must be unique.
    pub fn register_output(&mut self, output: Output) -> Result<()> {
        if self.outputs.contains_key(&output.name) {
            return Err(Error::AlreadyExists(format!(
                "output type \"{}\"",
                output.name
            )));
        }
        self.outputs.insert(output.name.clone(), output);
        Ok(())
    }

    pub fn get_output(&self, name: &str) -> Option<&Output> {
        self.outputs.get(name)
    }

    pub fn set_device_data_validator(&mut self, v: DeviceDataValidator) {
        self.validator = Some(v)
    }

    /// Accepts a built device, enforcing id and alias uniqueness and
    /// running the plugin's data validator. The device lands in all
    /// three indices or none of them.
    pub fn add_device(&mut self, device: Device) -> Result<Arc<Device>> {
        if self.devices.contains_key(&device.id) {
            return Err(Error::AlreadyExists(format!(
                "device id {} ({})",
                device.id, device.id_name
            )));
        }

        if let Some(alias) = &device.alias {
            if self.aliases.contains_key(alias) {
                return Err(Error::AlreadyExists(format!(
                    "device alias \"{}\"",
                    alias
                )));
            }
        }

        if let Some(validator) = &self.validator {
            validator(&device.data)?
        }

        let device = Arc::new(device);

        if let Some(alias) = &device.alias {
            self.aliases.insert(alias.clone(), device.clone());
        }
        for tag in &device.tags {
            self.tags.add(tag, &device)
        }
        self.devices.insert(device.id.clone(), device.clone());

        info!(id = %device.id, device_type = %device.device_type, "added device");
        Ok(device)
    }

    /// Builds and registers every instance of every prototype in the
    /// given configs. All construction problems are reported
    /// together.
    pub fn load_config(&mut self, configs: &[DeviceConfig]) -> Result<()> {
        let handlers = self.handlers.clone();
        let outputs = self.outputs.clone();
        let builder = Builder {
            namespace: self.namespace,
            handlers: &handlers,
            outputs: &outputs,
        };
        let mut errs = MultiError::new();
        let mut built = vec![];

        for config in configs {
            for proto in &config.devices {
                for instance in &proto.instances {
                    if let Some(dev) = errs.absorb(builder.build(proto, instance)) {
                        built.push(dev)
                    }
                }
            }
        }

        for dev in built {
            let _ = errs.absorb(self.add_device(dev));
        }
        errs.into_result()
    }

    /// Runs the plugin's dynamic registrars over each entry of the
    /// dynamic registration config, then applies the configured
    /// policy to the aggregate outcome.
    pub fn run_dynamic_registration(
        &mut self,
        cfg: &DynamicRegistration,
        config_registrar: Option<&DynamicConfigRegistrar>,
        device_registrar: Option<&DynamicDeviceRegistrar>,
    ) -> Result<()> {
        let policy = RegistrationPolicy::from_config(&cfg.policy)?;

        if cfg.config.is_empty()
            || (config_registrar.is_none() && device_registrar.is_none())
        {
            return match policy {
                RegistrationPolicy::Required => Err(Error::PolicyViolation(
                    "dynamic registration is required but nothing is configured"
                        .into(),
                )),
                RegistrationPolicy::Optional => Ok(()),
            };
        }

        let handlers = self.handlers.clone();
        let outputs = self.outputs.clone();
        let builder = Builder {
            namespace: self.namespace,
            handlers: &handlers,
            outputs: &outputs,
        };
        let mut errs = MultiError::new();
        let mut built = vec![];

        for entry in &cfg.config {
            if let Some(registrar) = config_registrar {
                if let Some(protos) = errs.absorb(registrar(entry)) {
                    for proto in &protos {
                        for instance in &proto.instances {
                            if let Some(dev) =
                                errs.absorb(builder.build(proto, instance))
                            {
                                built.push(dev)
                            }
                        }
                    }
                }
            }

            if let Some(registrar) = device_registrar {
                if let Some(devices) = errs.absorb(registrar(entry, &builder)) {
                    built.extend(devices)
                }
            }
        }

        let mut produced = 0;

        for dev in built {
            if errs.absorb(self.add_device(dev)).is_some() {
                produced += 1
            }
        }

        match policy {
            RegistrationPolicy::Required => {
                errs.into_result()?;
                if produced == 0 {
                    Err(Error::PolicyViolation(
                        "dynamic registration is required but produced no devices"
                            .into(),
                    ))
                } else {
                    Ok(())
                }
            }
            RegistrationPolicy::Optional => {
                if !errs.is_empty() {
                    warn!("dynamic registration discarded failures -- {}", errs)
                }
                Ok(())
            }
        }
    }

    /// Runs each registered setup action once over every device its
    /// filter matches. Filter and action failures fail startup,
    /// reported together.
    pub async fn run_setup_actions(
        &self,
        actions: &[DeviceSetupAction],
    ) -> Result<()> {
        let mut errs = MultiError::new();

        for setup in actions {
            if errs.absorb(setup.validate()).is_none() {
                continue;
            }

            for device in self.all_devices() {
                if setup.matches(&device) {
                    let _ = errs.absorb(
                        setup.action.run(&device).await.map_err(|e| {
                            Error::Config(format!(
                                "setup action \"{}\" failed on {}: {}",
                                setup.action.name(),
                                device.id,
                                e
                            ))
                        }),
                    );
                }
            }
        }
        errs.into_result()
    }

    /// Looks a device up by id, falling back to the alias index.
    pub fn get_device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices
            .get(id)
            .or_else(|| self.aliases.get(id))
            .cloned()
    }

    /// Resolves a selector to its devices, sorted by (sort index,
    /// id). An explicit id wins over tags; an empty selector selects
    /// everything.
    pub fn get_devices(&self, selector: &Selector) -> Vec<Arc<Device>> {
        if !selector.id.is_empty() {
            if !selector.tags.is_empty() {
                warn!(
                    id = %selector.id,
                    "selector has both id and tags; using id"
                )
            }
            return self.get_device(&selector.id).into_iter().collect();
        }

        let mut found = if selector.tags.is_empty() {
            self.tags.all_devices()
        } else {
            self.tags.get_devices_from_tags(&selector.tags)
        };

        sort_devices(&mut found);
        found
    }

    /// Every registered device, sorted by (sort index, id).
    pub fn all_devices(&self) -> Vec<Arc<Device>> {
        let mut found: Vec<Arc<Device>> = self.devices.values().cloned().collect();

        sort_devices(&mut found);
        found
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

fn sort_devices(devices: &mut [Arc<Device>]) {
    devices.sort_by(|a, b| {
        a.sort_index
            .cmp(&b.sort_index)
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Identifies devices in an RPC request: an explicit id (which may
/// be an alias) or a set of tags to intersect.
#[derive(Debug, Default, Clone)]
pub struct Selector {
    pub id: String,
    pub tags: Vec<Tag>,
}

impl Selector {
    pub fn by_id(id: &str) -> Selector {
        Selector {
            id: id.into(),
            tags: vec![],
        }
    }

    pub fn by_tags(tags: Vec<Tag>) -> Selector {
        Selector {
            id: String::new(),
            tags,
        }
    }
}
