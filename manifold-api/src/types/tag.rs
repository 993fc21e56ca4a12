//! Defines and enforces device tag requirements.
//!
//! Every device carries a set of tags, and selectors group devices by
//! intersecting them. A tag is a (namespace, annotation, label)
//! triple written as `label`, `namespace/label`, `annotation:label`,
//! or `namespace/annotation:label`. Each component consists of one or
//! more UTF-8 alphanumeric, dash, underscore, or period characters.
//!
//! A namespace omitted from the string form defaults to `default`.
//! Tags generated by the framework live in the `system` namespace
//! under the `id` and `type` annotations. The special label `**`
//! selects every device in a namespace (restricted to an annotation,
//! if one is given).
//!
//! Tag strings may contain `{{ env "NAME" }}` template regions which
//! are resolved against the process environment when the tag is
//! parsed. Tags are immutable after construction.

use crate::types::{template, Error};
use crate::Result;
use serde_derive::Deserialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// The namespace assumed when a tag string doesn't name one.
pub const NAMESPACE_DEFAULT: &str = "default";

/// The namespace reserved for framework-generated tags.
pub const NAMESPACE_SYSTEM: &str = "system";

/// Annotation of the auto-generated id tag.
pub const ANNOTATION_ID: &str = "id";

/// Annotation of the auto-generated type tag.
pub const ANNOTATION_TYPE: &str = "type";

/// The label that selects every device in a namespace.
pub const LABEL_ALL: &str = "**";

// Returns `true` if the character can be used in a tag component.

fn is_valid_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '-' || ch == '_' || ch == '.'
}

// Validates one component of a tag. Only labels may use the `**`
// wildcard form.

fn validate(part: &str, what: &str, wildcard: bool) -> Result<()> {
    if part.is_empty() {
        return Err(Error::Parse(format!("tag {} is empty", what)));
    }

    if part == LABEL_ALL {
        return if wildcard {
            Ok(())
        } else {
            Err(Error::Parse(format!("tag {} can't be \"**\"", what)))
        };
    }

    if part.chars().all(is_valid_char) {
        Ok(())
    } else {
        Err(Error::Parse(format!(
            "tag {} \"{}\" contains an invalid character",
            what, part
        )))
    }
}

/// Holds a validated device tag.
///
/// Equality and hashing consider only the triple, so `foo` and
/// `default/foo` are the same tag. The original spelling is retained
/// so `Display` can reproduce it (the `default/` prefix is printed
/// only when the source string included it).
#[derive(Debug, Clone, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Tag {
    namespace: String,
    annotation: Option<String>,
    label: String,
    explicit_namespace: bool,
}

impl Tag {
    /// Parses a tag from its string form, resolving `{{ env "..." }}`
    /// templates first. Leading and trailing whitespace is ignored.
    pub fn create(s: &str) -> Result<Tag> {
        let s = template::substitute(s.trim(), template::env_resolver)?;
        let s = s.trim();

        let (namespace, explicit_namespace, rest) = match s.split_once('/') {
            Some((ns, rest)) => (ns, true, rest),
            None => (NAMESPACE_DEFAULT, false, s),
        };

        let (annotation, label) = match rest.split_once(':') {
            Some((ann, label)) => (Some(ann), label),
            None => (None, rest),
        };

        validate(namespace, "namespace", false)?;
        if let Some(ann) = annotation {
            validate(ann, "annotation", false)?
        }
        validate(label, "label", true)?;

        Ok(Tag {
            namespace: namespace.into(),
            annotation: annotation.map(String::from),
            label: label.into(),
            explicit_namespace,
        })
    }

    /// Builds the framework-generated `system/id:<id>` tag.
    pub fn system_id(id: &str) -> Tag {
        Tag {
            namespace: NAMESPACE_SYSTEM.into(),
            annotation: Some(ANNOTATION_ID.into()),
            label: id.into(),
            explicit_namespace: true,
        }
    }

    /// Builds the framework-generated `system/type:<type>` tag.
    pub fn system_type(device_type: &str) -> Tag {
        Tag {
            namespace: NAMESPACE_SYSTEM.into(),
            annotation: Some(ANNOTATION_TYPE.into()),
            label: device_type.into(),
            explicit_namespace: true,
        }
    }

    /// Builds a tag from already validated components. Used by the
    /// RPC surface, whose selectors carry the triple in structured
    /// form rather than as strings.
    pub fn from_parts(
        namespace: &str,
        annotation: &str,
        label: &str,
    ) -> Result<Tag> {
        let namespace = if namespace.is_empty() {
            NAMESPACE_DEFAULT
        } else {
            namespace
        };

        validate(namespace, "namespace", false)?;
        if !annotation.is_empty() {
            validate(annotation, "annotation", false)?
        }
        validate(label, "label", true)?;

        Ok(Tag {
            namespace: namespace.into(),
            annotation: if annotation.is_empty() {
                None
            } else {
                Some(annotation.into())
            },
            label: label.into(),
            explicit_namespace: true,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns `true` for tags whose label is the `**` wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.label == LABEL_ALL
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace
            && self.annotation == other.annotation
            && self.label == other.label
    }
}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.annotation.hash(state);
        self.label.hash(state);
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.explicit_namespace || self.namespace != NAMESPACE_DEFAULT {
            write!(f, "{}/", &self.namespace)?
        }
        if let Some(ann) = &self.annotation {
            write!(f, "{}:", ann)?
        }
        write!(f, "{}", &self.label)
    }
}

impl TryFrom<String> for Tag {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Tag::create(&s)
    }
}

// This trait allows one to use `.parse::<Tag>()`.

impl FromStr for Tag {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Tag::create(s)
    }
}
