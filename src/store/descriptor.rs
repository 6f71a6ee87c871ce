//! Datastore descriptor, the versioning and typing information a client
//! declares for one record collection.

use serde::{Deserialize, Serialize};

use crate::index::KeyOrder;

/// Declaration of one direct or secondary index.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub name: String,
    /// Type name of the indexed value, as declared by the client.
    pub indexed_type: String,
    pub version: String,
}

impl IndexDescriptor {
    pub fn new(name: &str, indexed_type: &str, version: &str) -> IndexDescriptor {
        IndexDescriptor {
            name: name.to_string(),
            indexed_type: indexed_type.to_string(),
            version: version.to_string(),
        }
    }
}

/// Descriptor for one datastore: record version, declared type names and
/// the set of declared indexes.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub version: String,
    pub instance_type: String,
    pub identifier_type: String,
    #[serde(default)]
    pub direct_indexes: Vec<IndexDescriptor>,
    #[serde(default, alias = "referenceIndexes")]
    pub secondary_indexes: Vec<IndexDescriptor>,
}

impl Descriptor {
    pub fn new(version: &str, instance_type: &str, identifier_type: &str) -> Descriptor {
        Descriptor {
            version: version.to_string(),
            instance_type: instance_type.to_string(),
            identifier_type: identifier_type.to_string(),
            direct_indexes: vec![],
            secondary_indexes: vec![],
        }
    }

    pub fn add_direct_index(&mut self, index: IndexDescriptor) -> &mut Self {
        self.direct_indexes.push(index);
        self
    }

    pub fn add_secondary_index(&mut self, index: IndexDescriptor) -> &mut Self {
        self.secondary_indexes.push(index);
        self
    }

    /// Ordering for identifier bytes, derived from the declared
    /// identifier type name.
    pub fn to_key_order(&self) -> KeyOrder {
        match self.identifier_type.as_str() {
            "UUID" | "Uuid" | "uuid" => KeyOrder::Uuid,
            "DatedId" => KeyOrder::Dated,
            _ => KeyOrder::Lexicographic,
        }
    }

    pub fn find_direct(&self, name: &str) -> Option<&IndexDescriptor> {
        self.direct_indexes.iter().find(|ix| ix.name == name)
    }

    pub fn find_secondary(&self, name: &str) -> Option<&IndexDescriptor> {
        self.secondary_indexes.iter().find(|ix| ix.name == name)
    }
}
