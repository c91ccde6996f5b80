//! Local handles for remote entities.
//!
//! A handle holds its id plus lazily fetched facts that never change for the
//! lifetime of the entity. Handles are created through the session's identity
//! caches, so two handles for the same id are always the same `Arc`.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::{
    connection::Connection,
    error::Result,
    types::{AssemblyId, DomainId, MethodId, ModuleId, ModuleInfo, ObjectId, TypeId, TypeInfo},
};

/// How an object handle was materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Plain,
    Thread,
    String,
}

#[derive(Debug)]
pub struct ObjectMirror {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub type_id: TypeId,
    pub domain_id: DomainId,
}

impl ObjectMirror {
    pub fn is_thread(&self) -> bool {
        self.kind == ObjectKind::Thread
    }

    pub fn is_string(&self) -> bool {
        self.kind == ObjectKind::String
    }
}

#[derive(Debug)]
pub struct TypeMirror {
    pub id: TypeId,
    info: OnceCell<TypeInfo>,
}

impl TypeMirror {
    pub fn new(id: TypeId) -> Self {
        Self {
            id,
            info: OnceCell::new(),
        }
    }

    /// `TYPE.GET_INFO`, fetched once.
    pub async fn info(&self, conn: &Connection) -> Result<&TypeInfo> {
        self.info.get_or_try_init(|| conn.type_info(self.id)).await
    }

    pub fn cached_info(&self) -> Option<&TypeInfo> {
        self.info.get()
    }
}

#[derive(Debug)]
pub struct MethodMirror {
    pub id: MethodId,
    name: OnceCell<String>,
    declaring_type: OnceCell<TypeId>,
}

impl MethodMirror {
    pub fn new(id: MethodId) -> Self {
        Self {
            id,
            name: OnceCell::new(),
            declaring_type: OnceCell::new(),
        }
    }

    pub async fn name(&self, conn: &Connection) -> Result<&str> {
        self.name
            .get_or_try_init(|| conn.method_name(self.id))
            .await
            .map(String::as_str)
    }

    pub async fn declaring_type(&self, conn: &Connection) -> Result<TypeId> {
        self.declaring_type
            .get_or_try_init(|| conn.method_declaring_type(self.id))
            .await
            .copied()
    }
}

#[derive(Debug)]
pub struct ModuleMirror {
    pub id: ModuleId,
    info: OnceCell<ModuleInfo>,
}

impl ModuleMirror {
    pub fn new(id: ModuleId) -> Self {
        Self {
            id,
            info: OnceCell::new(),
        }
    }

    pub async fn info(&self, conn: &Connection) -> Result<&ModuleInfo> {
        self.info.get_or_try_init(|| conn.module_info(self.id)).await
    }
}

#[derive(Debug)]
pub struct AssemblyMirror {
    pub id: AssemblyId,
    name: OnceCell<String>,
}

impl AssemblyMirror {
    pub fn new(id: AssemblyId) -> Self {
        Self {
            id,
            name: OnceCell::new(),
        }
    }

    pub async fn name(&self, conn: &Connection) -> Result<&str> {
        self.name
            .get_or_try_init(|| conn.assembly_name(self.id))
            .await
            .map(String::as_str)
    }
}

#[derive(Debug)]
pub struct DomainMirror {
    pub id: DomainId,
    corlib: OnceCell<AssemblyId>,
    friendly_name: OnceCell<String>,
}

impl DomainMirror {
    pub fn new(id: DomainId) -> Self {
        Self {
            id,
            corlib: OnceCell::new(),
            friendly_name: OnceCell::new(),
        }
    }

    /// The domain's core library assembly, fetched once.
    pub async fn corlib(&self, conn: &Connection) -> Result<AssemblyId> {
        self.corlib
            .get_or_try_init(|| conn.domain_corlib(self.id))
            .await
            .copied()
    }

    pub async fn friendly_name(&self, conn: &Connection) -> Result<&str> {
        self.friendly_name
            .get_or_try_init(|| conn.domain_friendly_name(self.id))
            .await
            .map(String::as_str)
    }
}

/// Any identity-cached handle.
#[derive(Clone, Debug)]
pub enum Mirror {
    Object(Arc<ObjectMirror>),
    Type(Arc<TypeMirror>),
    Method(Arc<MethodMirror>),
    Module(Arc<ModuleMirror>),
    Assembly(Arc<AssemblyMirror>),
    Domain(Arc<DomainMirror>),
}

impl Mirror {
    pub fn id(&self) -> u32 {
        match self {
            Mirror::Object(m) => m.id,
            Mirror::Type(m) => m.id,
            Mirror::Method(m) => m.id,
            Mirror::Module(m) => m.id,
            Mirror::Assembly(m) => m.id,
            Mirror::Domain(m) => m.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mirror::Object(_) => "object",
            Mirror::Type(_) => "type",
            Mirror::Method(_) => "method",
            Mirror::Module(_) => "module",
            Mirror::Assembly(_) => "assembly",
            Mirror::Domain(_) => "domain",
        }
    }

    /// Identity comparison: same kind and same cached handle.
    pub fn same_as(&self, other: &Mirror) -> bool {
        match (self, other) {
            (Mirror::Object(a), Mirror::Object(b)) => Arc::ptr_eq(a, b),
            (Mirror::Type(a), Mirror::Type(b)) => Arc::ptr_eq(a, b),
            (Mirror::Method(a), Mirror::Method(b)) => Arc::ptr_eq(a, b),
            (Mirror::Module(a), Mirror::Module(b)) => Arc::ptr_eq(a, b),
            (Mirror::Assembly(a), Mirror::Assembly(b)) => Arc::ptr_eq(a, b),
            (Mirror::Domain(a), Mirror::Domain(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_as_compares_handles_not_ids() {
        let a = Arc::new(TypeMirror::new(7));
        let b = Arc::new(TypeMirror::new(7));
        assert!(Mirror::Type(a.clone()).same_as(&Mirror::Type(a.clone())));
        assert!(!Mirror::Type(a.clone()).same_as(&Mirror::Type(b)));
        assert!(!Mirror::Type(a).same_as(&Mirror::Method(Arc::new(MethodMirror::new(7)))));
    }
}
