//! Assembles runtime devices from prototype + instance configuration.
//!
//! Everything about a device is resolved here, once, at construction
//! time: inheritance, data and context merging, tag parsing, the
//! transform chain, the alias, and most importantly the
//! deterministic id. Nothing downstream re-evaluates templates or
//! re-merges maps, so the id a device gets at startup is the id it
//! keeps for the life of the process and across restarts.

use crate::config::{DeviceInstance, DeviceProto};
use crate::output::Output;
use manifold_api::{
    device::{Device, DEFAULT_WRITE_TIMEOUT},
    handler::Handler,
    transform::Transform,
    types::{tag::Tag, template},
    Error, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Derives the plugin-namespace UUID from the plugin's identity
/// string. Name-based (v5), so the same plugin id always produces
/// the same namespace.
pub fn plugin_namespace(plugin_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, plugin_id.as_bytes())
}

// Stringifies one data value for the id name. Scalars render
// directly; arrays render element-wise; tables don't contribute
// (there is no deterministic order to stringify them in, so they are
// treated as opaque).

fn stringify(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Integer(v) => Some(v.to_string()),
        toml::Value::Float(v) => Some(v.to_string()),
        toml::Value::Boolean(v) => Some(v.to_string()),
        toml::Value::Datetime(v) => Some(v.to_string()),
        toml::Value::Array(elems) => Some(
            elems
                .iter()
                .filter_map(stringify)
                .collect::<Vec<String>>()
                .join(","),
        ),
        toml::Value::Table(_) => None,
    }
}

/// The string a device's id is hashed from: type, handler, then the
/// value of each data key in sorted key order.
pub fn id_name(
    device_type: &str,
    handler: &str,
    data: &toml::value::Table,
) -> String {
    let mut parts = vec![String::from(device_type), String::from(handler)];
    let mut keys: Vec<&String> = data.keys().collect();

    keys.sort();
    for key in keys {
        if let Some(v) = stringify(&data[key]) {
            parts.push(v)
        }
    }
    parts.join(".")
}

/// Hashes an id name into the device id under the plugin namespace.
pub fn device_id(namespace: &Uuid, id_name: &str) -> String {
    Uuid::new_v5(namespace, id_name.as_bytes()).to_string()
}

/// Deep-merges two data tables, `over` winning per key. Sub-tables
/// merge recursively; a key holding a table on one side and a scalar
/// on the other can't be reconciled and is an error.
pub fn merge_data(
    base: &toml::value::Table,
    over: &toml::value::Table,
) -> Result<toml::value::Table> {
    let mut merged = base.clone();

    for (key, value) in over {
        match (merged.get(key), value) {
            (Some(toml::Value::Table(a)), toml::Value::Table(b)) => {
                let sub = merge_data(a, b)?;

                merged.insert(key.clone(), toml::Value::Table(sub));
            }
            (Some(toml::Value::Table(_)), _) | (Some(_), toml::Value::Table(_)) => {
                return Err(Error::Config(format!(
                    "data key \"{}\" is a map on one side and a scalar on the other",
                    key
                )))
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(merged)
}

// Merges context maps, instance winning, and resolves env templates
// in the values.

fn merge_context(
    base: &HashMap<String, String>,
    over: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut merged = base.clone();

    merged.extend(over.clone());
    merged
        .into_iter()
        .map(|(k, v)| {
            template::substitute(&v, template::env_resolver).map(|v| (k, v))
        })
        .collect()
}

// Parses and unions tag lists, prototype tags first. Duplicates
// (including respellings like `foo` vs `default/foo`) collapse.

fn merge_tags(proto: &[String], instance: &[String]) -> Result<Vec<Tag>> {
    let mut tags: Vec<Tag> = vec![];

    for s in proto.iter().chain(instance.iter()) {
        let tag = s.parse::<Tag>()?;

        if !tags.contains(&tag) {
            tags.push(tag)
        }
    }
    Ok(tags)
}

/// Builds devices against a fixed handler table and plugin
/// namespace. The device manager owns one; dynamic registrars are
/// handed a reference so the devices they produce go through exactly
/// the same path.
pub struct Builder<'a> {
    pub namespace: Uuid,
    pub handlers: &'a HashMap<String, Arc<Handler>>,
    pub outputs: &'a HashMap<String, Output>,
}

impl Builder<'_> {
    /// Creates the runtime device for one instance of a prototype.
    ///
    /// Inheritance covers `type`, `handler`, and `write_timeout` and
    /// can be disabled per instance. Tags always union, data always
    /// deep-merges (instance wins), context always merges (instance
    /// wins), and transforms always concatenate prototype-first.
    pub fn build(
        &self,
        proto: &DeviceProto,
        instance: &DeviceInstance,
    ) -> Result<Device> {
        let inherit = !instance.disable_inheritance;

        // Resolve the type; nothing works without one.

        let device_type = match &instance.device_type {
            Some(v) if !v.is_empty() => v.clone(),
            _ if inherit && !proto.device_type.is_empty() => {
                proto.device_type.clone()
            }
            _ => {
                return Err(Error::Config(format!(
                    "device instance \"{}\" has no type",
                    instance.info
                )))
            }
        };

        // Resolve the handler name, falling back to the type, and
        // make sure it names a registered handler.

        let handler_name = match &instance.handler {
            Some(v) if !v.is_empty() => v.clone(),
            _ if inherit && !proto.handler.is_empty() => proto.handler.clone(),
            _ => device_type.clone(),
        };

        let handler = self
            .handlers
            .get(&handler_name)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!("unknown handler \"{}\"", handler_name))
            })?;

        let write_timeout = match instance
            .write_timeout
            .or(if inherit { proto.write_timeout } else { None })
        {
            Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
            Some(secs) => {
                return Err(Error::Config(format!(
                    "write timeout must be > 0, got {}",
                    secs
                )))
            }
            None => DEFAULT_WRITE_TIMEOUT,
        };

        if let Some(output) = &instance.output {
            if !self.outputs.contains_key(output) {
                return Err(Error::Config(format!(
                    "unknown output type \"{}\"",
                    output
                )));
            }
        }

        let data = merge_data(&proto.data, &instance.data)?;
        let context = merge_context(&proto.context, &instance.context)?;
        let mut tags = merge_tags(&proto.tags, &instance.tags)?;

        let transforms = proto
            .transforms
            .iter()
            .chain(instance.transforms.iter())
            .map(|v| v.build())
            .collect::<Result<Vec<Transform>>>()?;

        // The id is a pure function of (namespace, type, handler,
        // data); nothing below may feed back into it.

        let id_name = id_name(&device_type, &handler_name, &data);
        let id = device_id(&self.namespace, &id_name);

        let alias = match &instance.alias {
            Some(tmpl) => Some(render_alias(
                tmpl,
                &id,
                &device_type,
                &handler_name,
                &instance.info,
            )?),
            None => None,
        };

        tags.push(Tag::system_id(&id));
        tags.push(Tag::system_type(&device_type));

        Ok(Device {
            id,
            id_name,
            device_type,
            info: instance.info.clone(),
            handler,
            data,
            context,
            tags,
            alias,
            sort_index: instance.sort_index,
            transforms,
            write_timeout,
            output: instance.output.clone(),
            write_lock: Mutex::new(()),
        })
    }
}

// Renders an alias, which is either a literal name or a template
// over the built device and the environment.

fn render_alias(
    tmpl: &str,
    id: &str,
    device_type: &str,
    handler: &str,
    info: &str,
) -> Result<String> {
    let alias = template::substitute(tmpl, |expr| match expr {
        "device.id" => Ok(id.into()),
        "device.type" => Ok(device_type.into()),
        "device.handler" => Ok(handler.into()),
        "device.info" => Ok(info.into()),
        _ => template::env_resolver(expr),
    })?;

    if alias.is_empty() {
        Err(Error::Config(format!("alias template \"{}\" renders empty", tmpl)))
    } else {
        Ok(alias)
    }
}
