//! The schema collaborator: attribute and link-id resolution.
//!
//! The engine only needs a narrow slice of the schema catalog: id to name
//! mapping, forward-link to reciprocal-link resolution, the naming attribute,
//! and replication/preservation flags. Everything else about attribute
//! semantics stays outside this engine.

use std::collections::HashMap;

use dsrepl_core::AttributeId;

use crate::error::EngineError;

/// Definition of one attribute as the engine sees it.
#[derive(Debug, Clone)]
pub struct AttributeDef {
    /// Numeric id.
    pub id: AttributeId,
    /// Display name.
    pub name: String,
    /// Reciprocal backlink attribute, when this is a forward link.
    pub backlink: Option<AttributeId>,
    /// False for constructed or explicitly non-replicated attributes, which
    /// are never stamped.
    pub replicated: bool,
    /// Kept through tombstoning in addition to the engine's fixed allowlist.
    pub preserved_on_delete: bool,
}

/// Schema lookups consumed by the engine. Lookup failure is an internal
/// consistency error that aborts the enclosing transaction.
pub trait Schema: Send + Sync {
    /// Resolves an attribute id to its definition.
    fn attribute(&self, id: AttributeId) -> Result<&AttributeDef, EngineError>;

    /// Resolves an attribute name to its id.
    fn attribute_by_name(&self, name: &str) -> Option<AttributeId>;

    /// The relative naming attribute, pinned last in stamp arrays.
    fn naming_attribute(&self) -> AttributeId;

    /// Reciprocal backlink id for a forward-link attribute.
    fn link_pair(&self, id: AttributeId) -> Result<AttributeId, EngineError> {
        self.attribute(id)?
            .backlink
            .ok_or(EngineError::UnknownLink(id))
    }

    /// True if `id` is a forward-link attribute.
    fn is_forward_link(&self, id: AttributeId) -> bool {
        self.attribute(id).map(|a| a.backlink.is_some()).unwrap_or(false)
    }
}

/// In-memory schema used by tests and embedding hosts.
#[derive(Debug)]
pub struct TestSchema {
    by_id: HashMap<AttributeId, AttributeDef>,
    by_name: HashMap<String, AttributeId>,
    naming: AttributeId,
}

impl TestSchema {
    /// Creates a schema with the well-known structural attributes registered
    /// and `naming` as the relative naming attribute.
    pub fn new(naming: AttributeId) -> Self {
        let mut s = TestSchema {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            naming,
        };
        s.register(AttributeDef {
            id: naming,
            name: "name".to_string(),
            backlink: None,
            replicated: true,
            preserved_on_delete: true,
        });
        s.register(AttributeDef {
            id: AttributeId::INSTANCE_TYPE,
            name: "instanceType".to_string(),
            backlink: None,
            replicated: true,
            preserved_on_delete: true,
        });
        s.register(AttributeDef {
            id: AttributeId::IS_DELETED,
            name: "isDeleted".to_string(),
            backlink: None,
            replicated: true,
            preserved_on_delete: true,
        });
        s.register(AttributeDef {
            id: AttributeId::IS_RECYCLED,
            name: "isRecycled".to_string(),
            backlink: None,
            replicated: true,
            preserved_on_delete: true,
        });
        s.register(AttributeDef {
            id: AttributeId::LAST_KNOWN_PARENT,
            name: "lastKnownParent".to_string(),
            backlink: None,
            replicated: true,
            preserved_on_delete: true,
        });
        s.register(AttributeDef {
            id: AttributeId::LAST_KNOWN_RDN,
            name: "lastKnownRdn".to_string(),
            backlink: None,
            replicated: true,
            preserved_on_delete: true,
        });
        s
    }

    /// Registers or replaces an attribute definition.
    pub fn register(&mut self, def: AttributeDef) {
        self.by_name.insert(def.name.clone(), def.id);
        self.by_id.insert(def.id, def);
    }

    /// Registers a plain replicated attribute.
    pub fn plain(&mut self, id: u32, name: &str) -> AttributeId {
        let id = AttributeId::new(id);
        self.register(AttributeDef {
            id,
            name: name.to_string(),
            backlink: None,
            replicated: true,
            preserved_on_delete: false,
        });
        id
    }

    /// Registers a forward link and its reciprocal backlink.
    pub fn link(&mut self, forward: u32, fname: &str, back: u32, bname: &str) -> AttributeId {
        let fid = AttributeId::new(forward);
        let bid = AttributeId::new(back);
        self.register(AttributeDef {
            id: fid,
            name: fname.to_string(),
            backlink: Some(bid),
            replicated: true,
            preserved_on_delete: false,
        });
        self.register(AttributeDef {
            id: bid,
            name: bname.to_string(),
            backlink: None,
            replicated: false, // backlinks are derived, never replicated
            preserved_on_delete: false,
        });
        fid
    }

    /// Registers a non-replicated (constructed) attribute.
    pub fn constructed(&mut self, id: u32, name: &str) -> AttributeId {
        let id = AttributeId::new(id);
        self.register(AttributeDef {
            id,
            name: name.to_string(),
            backlink: None,
            replicated: false,
            preserved_on_delete: false,
        });
        id
    }
}

impl Schema for TestSchema {
    fn attribute(&self, id: AttributeId) -> Result<&AttributeDef, EngineError> {
        self.by_id.get(&id).ok_or(EngineError::UnknownAttribute(id))
    }

    fn attribute_by_name(&self, name: &str) -> Option<AttributeId> {
        self.by_name.get(name).copied()
    }

    fn naming_attribute(&self) -> AttributeId {
        self.naming
    }
}
