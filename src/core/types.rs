use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::errors::ObjectKind;

// The label itself. Whatever else the engine sends back rides along in `attributes`
// so callers get the full record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AffinityLabel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Reference to another engine object, as found in collections and nested links.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Link {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl Link {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            href: None,
        }
    }
}

/// A VM or a host, trimmed down to what label membership needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Link>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Vms,
    Hosts,
}

/// Static description of one assignable kind.
#[derive(Debug)]
pub struct KindSpec {
    /// Collection segment under the API root and under a label.
    pub collection: &'static str,
    /// Key wrapping each element in collection payloads.
    pub element: &'static str,
    pub object: ObjectKind,
}

static KIND_TABLE: [KindSpec; 2] = [
    KindSpec {
        collection: "vms",
        element: "vm",
        object: ObjectKind::Vm,
    },
    KindSpec {
        collection: "hosts",
        element: "host",
        object: ObjectKind::Host,
    },
];

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Vms, EntityKind::Hosts];

    pub fn spec(self) -> &'static KindSpec {
        match self {
            EntityKind::Vms => &KIND_TABLE[0],
            EntityKind::Hosts => &KIND_TABLE[1],
        }
    }

    pub fn collection(self) -> &'static str {
        self.spec().collection
    }

    pub fn element(self) -> &'static str {
        self.spec().element
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// Body of an "add assignment" call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRef {
    Vm { id: String },
    Host { id: String },
}

impl ObjectRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        let id = id.into();
        match kind {
            EntityKind::Vms => ObjectRef::Vm { id },
            EntityKind::Hosts => ObjectRef::Host { id },
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ObjectRef::Vm { .. } => EntityKind::Vms,
            ObjectRef::Host { .. } => EntityKind::Hosts,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ObjectRef::Vm { id } | ObjectRef::Host { id } => id,
        }
    }

    pub fn to_body(&self) -> Value {
        serde_json::json!({ "id": self.id() })
    }
}

/// Name lookup, optionally narrowed to one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub name: String,
    pub cluster: Option<String>,
}

impl SearchQuery {
    pub fn new(name: impl Into<String>, cluster: Option<&str>) -> Self {
        Self {
            name: name.into(),
            cluster: cluster.map(str::to_string),
        }
    }

    /// Engine search expression, e.g. `name=vm1 and cluster=prod`.
    pub fn expression(&self) -> String {
        match &self.cluster {
            Some(cluster) => format!("name={} and cluster={}", self.name, cluster),
            None => format!("name={}", self.name),
        }
    }
}
