//! The tag index.
//!
//! A three-level map, namespace → annotation → label → devices, that
//! backs selector queries. Entries are only written while the device
//! manager is assembling (startup and dynamic registration, both
//! before the scheduler starts); afterwards the cache is read-only
//! and shared without locking.
//!
//! Wildcard (`**`) tags are never stored. A wildcard query scans the
//! namespace level instead, so the cache always satisfies: every
//! device listed under a key carries that exact tag.

use manifold_api::{device::Device, types::tag, types::tag::Tag, Result};
use std::collections::HashMap;
use std::sync::Arc;

// Tags without an annotation index under the empty string.

fn annotation_key(tag: &Tag) -> &str {
    tag.annotation().unwrap_or("")
}

type LabelMap = HashMap<String, Vec<Arc<Device>>>;
type AnnotationMap = HashMap<String, LabelMap>;

#[derive(Default)]
pub struct TagCache {
    namespaces: HashMap<String, AnnotationMap>,
}

impl TagCache {
    pub fn new() -> TagCache {
        TagCache::default()
    }

    /// Indexes a device under a tag. Wildcard tags aren't cacheable
    /// and are ignored; duplicate device entries under one key are
    /// dropped.
    pub fn add(&mut self, tag: &Tag, device: &Arc<Device>) {
        if tag.is_wildcard() {
            return;
        }

        let devices = self
            .namespaces
            .entry(tag.namespace().into())
            .or_default()
            .entry(annotation_key(tag).into())
            .or_default()
            .entry(tag.label().into())
            .or_default();

        if !devices.iter().any(|v| v.id == device.id) {
            devices.push(device.clone())
        }
    }

    // The candidate set for a single tag. Wildcards expand to the
    // namespace scan, restricted to the annotation when one is given.

    fn candidates(&self, tag: &Tag) -> Vec<&Arc<Device>> {
        let Some(annotations) = self.namespaces.get(tag.namespace()) else {
            return vec![];
        };

        if tag.is_wildcard() {
            let mut found: Vec<&Arc<Device>> = vec![];

            match tag.annotation() {
                Some(ann) => {
                    if let Some(labels) = annotations.get(ann) {
                        found.extend(labels.values().flatten())
                    }
                }
                None => {
                    found.extend(annotations.values().flat_map(|v| v.values()).flatten())
                }
            }
            dedup(&mut found);
            found
        } else {
            annotations
                .get(annotation_key(tag))
                .and_then(|labels| labels.get(tag.label()))
                .map(|devices| devices.iter().collect())
                .unwrap_or_default()
        }
    }

    /// Returns the devices whose tag sets contain every given tag.
    /// The first tag seeds the result; each further tag intersects
    /// it. Any tag that matches nothing empties the result
    /// immediately.
    pub fn get_devices_from_tags(&self, tags: &[Tag]) -> Vec<Arc<Device>> {
        let mut found: Option<Vec<&Arc<Device>>> = None;

        for tag in tags {
            let candidates = self.candidates(tag);

            found = Some(match found {
                None => candidates,
                Some(set) => {
                    let mut kept: Vec<&Arc<Device>> = vec![];

                    for dev in set {
                        if candidates.iter().any(|v| v.id == dev.id) {
                            kept.push(dev)
                        }
                    }
                    kept
                }
            });

            if found.as_ref().map(Vec::is_empty).unwrap_or(false) {
                break;
            }
        }

        found
            .unwrap_or_default()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Returns the union of every device in the given namespaces,
    /// de-duplicated by device id.
    pub fn get_devices_from_namespace(&self, namespaces: &[&str]) -> Vec<Arc<Device>> {
        let mut found: Vec<&Arc<Device>> = vec![];

        for ns in namespaces {
            if let Some(annotations) = self.namespaces.get(*ns) {
                found.extend(annotations.values().flat_map(|v| v.values()).flatten())
            }
        }
        dedup(&mut found);
        found.into_iter().cloned().collect()
    }

    /// Parses tag strings, then queries with the result.
    pub fn get_devices_from_strings(&self, tags: &[String]) -> Result<Vec<Arc<Device>>> {
        let parsed = tags
            .iter()
            .map(|v| v.parse::<Tag>())
            .collect::<Result<Vec<Tag>>>()?;

        Ok(self.get_devices_from_tags(&parsed))
    }

    /// Every device known to the cache. Each device carries its
    /// `system/id` tag, so scanning the system namespace is a full
    /// scan.
    pub fn all_devices(&self) -> Vec<Arc<Device>> {
        self.get_devices_from_namespace(&[tag::NAMESPACE_SYSTEM])
    }
}

fn dedup(devices: &mut Vec<&Arc<Device>>) {
    let mut seen = std::collections::HashSet::new();

    devices.retain(|dev| seen.insert(dev.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_api::device::DEFAULT_WRITE_TIMEOUT;
    use manifold_api::handler::Handler;
    use tokio::sync::Mutex;

    fn make_device(id: &str, tags: &[&str]) -> Arc<Device> {
        let mut parsed: Vec<Tag> =
            tags.iter().map(|v| v.parse().unwrap()).collect();

        parsed.push(Tag::system_id(id));
        parsed.push(Tag::system_type("test"));

        Arc::new(Device {
            id: id.into(),
            id_name: format!("test.test.{}", id),
            device_type: "test".into(),
            info: String::new(),
            handler: Arc::new(Handler::new("test")),
            data: toml::value::Table::new(),
            context: HashMap::new(),
            tags: parsed,
            alias: None,
            sort_index: 0,
            transforms: vec![],
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            output: None,
            write_lock: Mutex::new(()),
        })
    }

    fn cache_of(devices: &[&Arc<Device>]) -> TagCache {
        let mut cache = TagCache::new();

        for dev in devices {
            for tag in &dev.tags {
                cache.add(tag, dev)
            }
        }
        cache
    }

    fn ids(devices: &[Arc<Device>]) -> Vec<String> {
        let mut ids: Vec<String> =
            devices.iter().map(|v| v.id.clone()).collect();

        ids.sort();
        ids
    }

    #[test]
    fn test_add_dedup() {
        let dev = make_device("a", &["foo"]);
        let mut cache = TagCache::new();
        let tag = "foo".parse::<Tag>().unwrap();

        cache.add(&tag, &dev);
        cache.add(&tag, &dev);

        assert_eq!(cache.get_devices_from_tags(&[tag]).len(), 1);
    }

    #[test]
    fn test_wildcard_not_cached() {
        let dev = make_device("a", &[]);
        let mut cache = TagCache::new();

        cache.add(&"vapor/**".parse().unwrap(), &dev);

        assert!(cache
            .get_devices_from_namespace(&["vapor"])
            .is_empty());
    }

    #[test]
    fn test_intersection() {
        // The selector-intersection scenario: A has both tags, B and
        // C one each.

        let a = make_device("a", &["default/foo", "vapor/bar"]);
        let b = make_device("b", &["default/foo"]);
        let c = make_device("c", &["vapor/bar"]);
        let cache = cache_of(&[&a, &b, &c]);

        let foo = "default/foo".parse::<Tag>().unwrap();
        let bar = "vapor/bar".parse::<Tag>().unwrap();

        assert_eq!(
            ids(&cache.get_devices_from_tags(&[foo.clone(), bar.clone()])),
            vec!["a"]
        );
        assert_eq!(
            ids(&cache.get_devices_from_tags(&[foo.clone()])),
            vec!["a", "b"]
        );
        assert_eq!(
            ids(&cache.get_devices_from_tags(&[bar])),
            vec!["a", "c"]
        );

        // A tag that resolves nothing empties the intersection.

        let nope = "default/nope".parse::<Tag>().unwrap();

        assert!(cache.get_devices_from_tags(&[foo, nope]).is_empty());
        assert!(cache
            .get_devices_from_tags(&["other/foo".parse().unwrap()])
            .is_empty());
    }

    #[test]
    fn test_wildcard_query() {
        let a = make_device("a", &["vapor/rack:r1"]);
        let b = make_device("b", &["vapor/rack:r2"]);
        let c = make_device("c", &["vapor/zone"]);
        let cache = cache_of(&[&a, &b, &c]);

        assert_eq!(
            ids(&cache.get_devices_from_tags(&["vapor/**".parse().unwrap()])),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            ids(&cache
                .get_devices_from_tags(&["vapor/rack:**".parse().unwrap()])),
            vec!["a", "b"]
        );

        // Wildcards intersect like any other tag.

        assert_eq!(
            ids(&cache.get_devices_from_tags(&[
                "vapor/**".parse().unwrap(),
                "vapor/rack:r2".parse().unwrap(),
            ])),
            vec!["b"]
        );
    }

    #[test]
    fn test_namespace_union() {
        let a = make_device("a", &["east/foo"]);
        let b = make_device("b", &["west/foo", "east/bar"]);
        let cache = cache_of(&[&a, &b]);

        assert_eq!(ids(&cache.get_devices_from_namespace(&["east"])), vec!["a", "b"]);
        assert_eq!(ids(&cache.get_devices_from_namespace(&["west"])), vec!["b"]);
        assert_eq!(
            ids(&cache.get_devices_from_namespace(&["east", "west"])),
            vec!["a", "b"]
        );
        assert!(cache.get_devices_from_namespace(&["north"]).is_empty());

        // Every device carries system tags, so the system namespace
        // is a full scan.

        assert_eq!(ids(&cache.all_devices()), vec!["a", "b"]);
    }

    #[test]
    fn test_index_soundness() {
        // Every non-wildcard tag a device carries resolves back to
        // that device, and everything a tag resolves to carries the
        // tag.

        let devices = [
            make_device("a", &["default/foo", "vapor/bar", "zone:1"]),
            make_device("b", &["default/foo"]),
            make_device("c", &["vapor/bar", "zone:2"]),
        ];
        let cache = cache_of(&[&devices[0], &devices[1], &devices[2]]);

        for dev in &devices {
            for tag in &dev.tags {
                let found = cache.get_devices_from_tags(&[tag.clone()]);

                assert!(
                    found.iter().any(|v| v.id == dev.id),
                    "{} missing under {}",
                    dev.id,
                    tag
                );
                for listed in found {
                    assert!(listed.has_tag(tag))
                }
            }
        }
    }

    #[test]
    fn test_from_strings() {
        let a = make_device("a", &["foo"]);
        let cache = cache_of(&[&a]);

        assert_eq!(
            ids(&cache
                .get_devices_from_strings(&[String::from("foo")])
                .unwrap()),
            vec!["a"]
        );
        assert!(cache
            .get_devices_from_strings(&[String::from("not a tag!")])
            .is_err());
    }
}
