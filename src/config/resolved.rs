//! Resolved schema: config validated and flattened into node templates for runtime use.

use crate::error::GraphError;
use crate::graph::{MutationSpec, NodeSpec, Op, QuerySpec};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct ResolvedEntity {
    pub name: String,
    /// Table, id, declared columns and edges; no assignments.
    pub node: NodeSpec,
    /// Interceptor slots in declaration order.
    pub hooks: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedSchema {
    entities: Vec<ResolvedEntity>,
    by_name: HashMap<String, usize>,
}

impl ResolvedSchema {
    pub fn new(entities: Vec<ResolvedEntity>) -> Self {
        let by_name = entities.iter().enumerate().map(|(i, e)| (e.name.clone(), i)).collect();
        ResolvedSchema { entities, by_name }
    }

    pub fn entities(&self) -> &[ResolvedEntity] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&ResolvedEntity> {
        self.by_name.get(name).map(|&i| &self.entities[i])
    }

    /// Fresh node template for `entity`.
    pub fn node(&self, entity: &str) -> Result<NodeSpec, GraphError> {
        self.entity(entity)
            .map(|e| e.node.clone())
            .ok_or_else(|| GraphError::validation(entity, "unknown entity"))
    }

    pub fn mutation(&self, op: Op, entity: &str) -> Result<MutationSpec, GraphError> {
        Ok(MutationSpec::new(op, self.node(entity)?))
    }

    pub fn query(&self, entity: &str) -> Result<QuerySpec, GraphError> {
        Ok(QuerySpec::new(self.node(entity)?))
    }
}
