//! Declarative description of nodes, edges, mutations and queries consumed by the compiler.

use crate::config::ValidationRule;
use crate::predicate::Predicate;
use crate::sql::{ColumnTypes, Selector};
use serde::{Deserialize, Serialize};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Storage type of a column; decides how values are bound and decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int,
    Float,
    String,
    Enum,
    Uuid,
    Time,
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Enum => "enum",
            FieldType::Uuid => "uuid",
            FieldType::Time => "time",
            FieldType::Json => "json",
        };
        f.write_str(s)
    }
}

/// How a new node gets its id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGeneration {
    /// The store assigns it (autoincrement); returned via RETURNING.
    #[default]
    Store,
    /// A v4 UUID is generated before the insert unless one is provided.
    Uuid,
    /// The caller must provide it.
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdSpec {
    pub column: String,
    pub ty: FieldType,
    pub generation: IdGeneration,
}

/// Value filled in when a field is not set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Now,
    Uuid,
    Literal(Value),
}

impl DefaultValue {
    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Now => Value::String(
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            ),
            DefaultValue::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
            DefaultValue::Literal(v) => v.clone(),
        }
    }
}

/// A `pattern` rule compiled when the column is declared.
#[derive(Clone, Debug)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Pattern)
    }

    pub fn is_match(&self, s: &str) -> bool {
        self.0.is_match(s)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// A column declared for a table.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: FieldType,
    pub optional: bool,
    pub unique: bool,
    pub immutable: bool,
    pub default: Option<DefaultValue>,
    pub update_default: Option<DefaultValue>,
    pub validation: ValidationRule,
    pub pattern: Option<Pattern>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        ColumnSpec {
            name: name.into(),
            ty,
            optional: false,
            unique: false,
            immutable: false,
            default: None,
            update_default: None,
            validation: ValidationRule::default(),
            pattern: None,
        }
    }

    /// Attach value rules. `pattern` is compiled here, once.
    pub fn with_validation(mut self, rule: ValidationRule) -> Result<Self, regex::Error> {
        self.pattern = rule.pattern.as_deref().map(Pattern::new).transpose()?;
        self.validation = rule;
        Ok(self)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn default_value(mut self, d: DefaultValue) -> Self {
        self.default = Some(d);
        self
    }

    pub fn update_default(mut self, d: DefaultValue) -> Self {
        self.update_default = Some(d);
        self
    }

    /// Must be set on create: not optional and no default to fall back on.
    pub fn is_required(&self) -> bool {
        !self.optional && self.default.is_none()
    }
}

/// One field assignment.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub column: String,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    #[serde(rename = "o2o", alias = "one_to_one")]
    O2O,
    #[serde(rename = "o2m", alias = "one_to_many")]
    O2M,
    #[serde(rename = "m2m", alias = "many_to_many")]
    M2M,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    /// Deleting a node that is still referenced fails with a constraint violation.
    #[default]
    Restrict,
    /// Referencing rows are deleted with the node.
    Cascade,
    /// Referencing rows have their (nullable) foreign key cleared.
    SetNull,
}

/// Where the relation is materialized.
#[derive(Clone, Debug, PartialEq)]
pub enum Linkage {
    /// Foreign-key column; lives on the owning table or on the target depending on relation and direction.
    ForeignKey { column: String, nullable: bool },
    /// Join table holding (owner id, target id) plus edge-scoped columns.
    JoinTable {
        table: String,
        columns: [String; 2],
        fields: Vec<ColumnSpec>,
    },
}

/// The other end of an edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeTarget {
    pub entity: String,
    pub table: String,
    pub id_column: String,
    pub id_type: FieldType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EdgeSpec {
    pub name: String,
    pub rel: Relation,
    /// `false` for the owning side, `true` for the inverse side.
    pub inverse: bool,
    pub target: EdgeTarget,
    pub linkage: Linkage,
    pub required: bool,
    pub on_delete: OnDelete,
}

impl EdgeSpec {
    /// Whether the foreign key column lives on this node's table (M2O / inverse O2O).
    pub fn fk_on_self(&self) -> bool {
        matches!(self.linkage, Linkage::ForeignKey { .. })
            && matches!(self.rel, Relation::O2O | Relation::O2M)
            && self.inverse
    }

    pub fn fk_column(&self) -> Option<&str> {
        match &self.linkage {
            Linkage::ForeignKey { column, .. } => Some(column),
            Linkage::JoinTable { .. } => None,
        }
    }

    pub fn fk_nullable(&self) -> bool {
        matches!(self.linkage, Linkage::ForeignKey { nullable: true, .. })
    }

    /// At most one target per node.
    pub fn unique_target(&self) -> bool {
        match self.rel {
            Relation::O2O => true,
            Relation::O2M => self.inverse,
            Relation::M2M => false,
        }
    }

    /// Join table name with (this side, target side) columns for M2M edges.
    pub fn join(&self) -> Option<(&str, &str, &str)> {
        match &self.linkage {
            Linkage::JoinTable { table, columns, .. } if self.inverse => Some((table, &columns[1], &columns[0])),
            Linkage::JoinTable { table, columns, .. } => Some((table, &columns[0], &columns[1])),
            Linkage::ForeignKey { .. } => None,
        }
    }

    pub fn join_fields(&self) -> &[ColumnSpec] {
        match &self.linkage {
            Linkage::JoinTable { fields, .. } => fields,
            Linkage::ForeignKey { .. } => &[],
        }
    }

    /// Selector over the target table. When the foreign key lives there it is typed as the owner's id.
    pub fn target_selector(&self, owner_id_type: FieldType) -> Selector {
        let mut types = HashMap::new();
        types.insert(self.target.id_column.clone(), self.target.id_type);
        if let Some(c) = self.fk_column() {
            if !self.fk_on_self() {
                types.insert(c.to_string(), owner_id_type);
            }
        }
        Selector::new(self.target.table.clone(), self.target.id_column.clone(), Arc::new(types))
    }

    /// Selector over the join table of an M2M edge, keyed on this side's column.
    pub fn join_selector(&self, owner_id_type: FieldType) -> Option<Selector> {
        let (table, own, other) = self.join()?;
        let mut types = HashMap::new();
        types.insert(own.to_string(), owner_id_type);
        types.insert(other.to_string(), self.target.id_type);
        for f in self.join_fields() {
            types.insert(f.name.clone(), f.ty);
        }
        Some(Selector::new(table, own, Arc::new(types)))
    }
}

/// A node's table, identity, declared columns and edges, plus the assignments of one operation.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSpec {
    pub entity: String,
    pub table: String,
    pub id: IdSpec,
    pub id_value: Option<Value>,
    pub columns: Vec<ColumnSpec>,
    pub edges: Vec<EdgeSpec>,
    pub fields: Vec<FieldSpec>,
    pub cleared: Vec<String>,
}

impl NodeSpec {
    pub fn new(entity: impl Into<String>, table: impl Into<String>, id: IdSpec) -> Self {
        NodeSpec {
            entity: entity.into(),
            table: table.into(),
            id,
            id_value: None,
            columns: Vec::new(),
            edges: Vec::new(),
            fields: Vec::new(),
            cleared: Vec::new(),
        }
    }

    pub fn with_column(mut self, c: ColumnSpec) -> Self {
        self.columns.push(c);
        self
    }

    pub fn with_edge(mut self, e: EdgeSpec) -> Self {
        self.edges.push(e);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn edge(&self, name: &str) -> Option<&EdgeSpec> {
        self.edges.iter().find(|e| e.name == name)
    }

    /// Assign a field; a later assignment to the same column replaces the earlier one in place.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        self.cleared.retain(|c| *c != column);
        match self.fields.iter_mut().find(|f| f.column == column) {
            Some(f) => f.value = value,
            None => self.fields.push(FieldSpec { column, value }),
        }
    }

    pub fn field(&self, column: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.column == column).map(|f| &f.value)
    }

    /// Set a nullable column to NULL on update.
    pub fn clear(&mut self, column: impl Into<String>) {
        let column = column.into();
        self.fields.retain(|f| f.column != column);
        if !self.cleared.contains(&column) {
            self.cleared.push(column);
        }
    }

    /// Storage types for the id, declared columns, and foreign keys held on this table.
    pub fn types(&self) -> ColumnTypes {
        let mut types = HashMap::with_capacity(self.columns.len() + 1);
        types.insert(self.id.column.clone(), self.id.ty);
        for c in &self.columns {
            types.insert(c.name.clone(), c.ty);
        }
        for e in self.edges.iter().filter(|e| e.fk_on_self()) {
            if let Some(c) = e.fk_column() {
                types.insert(c.to_string(), e.target.id_type);
            }
        }
        Arc::new(types)
    }

    pub fn selector(&self) -> Selector {
        Selector::new(self.table.clone(), self.id.column.clone(), self.types())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
        })
    }
}

/// Add/remove/clear changes to one edge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EdgeMutation {
    pub edge: String,
    pub add: Vec<Value>,
    pub remove: Vec<Value>,
    pub clear: bool,
    /// Values for edge-scoped join-table columns on added rows.
    pub fields: Vec<FieldSpec>,
}

/// One create/update/delete. Owned by the single in-flight operation and consumed by execution.
#[derive(Clone, Debug)]
pub struct MutationSpec {
    pub op: Op,
    pub node: NodeSpec,
    pub predicates: Vec<Predicate>,
    pub edges: Vec<EdgeMutation>,
}

impl MutationSpec {
    pub fn new(op: Op, node: NodeSpec) -> Self {
        MutationSpec {
            op,
            node,
            predicates: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn create(node: NodeSpec) -> Self {
        Self::new(Op::Create, node)
    }

    pub fn update(node: NodeSpec) -> Self {
        Self::new(Op::Update, node)
    }

    pub fn delete(node: NodeSpec) -> Self {
        Self::new(Op::Delete, node)
    }

    pub fn entity(&self) -> &str {
        &self.node.entity
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.node.set(column, value);
        self
    }

    pub fn clear_field(mut self, column: impl Into<String>) -> Self {
        self.node.clear(column);
        self
    }

    /// Provide the id of the node to create.
    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.node.id_value = Some(id.into());
        self
    }

    pub fn where_p(mut self, p: Predicate) -> Self {
        self.predicates.push(p);
        self
    }

    fn edge_mut(&mut self, edge: &str) -> &mut EdgeMutation {
        let pos = match self.edges.iter().position(|e| e.edge == edge) {
            Some(pos) => pos,
            None => {
                self.edges.push(EdgeMutation {
                    edge: edge.to_string(),
                    ..Default::default()
                });
                self.edges.len() - 1
            }
        };
        &mut self.edges[pos]
    }

    pub fn add_edge<I, V>(mut self, edge: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.edge_mut(edge).add.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn remove_edge<I, V>(mut self, edge: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.edge_mut(edge).remove.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn clear_edge(mut self, edge: &str) -> Self {
        self.edge_mut(edge).clear = true;
        self
    }

    /// Set an edge-scoped column written on every join row this mutation adds for `edge`.
    pub fn edge_field(mut self, edge: &str, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.edge_mut(edge).fields.push(FieldSpec {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn edge_mutation(&self, edge: &str) -> Option<&EdgeMutation> {
        self.edges.iter().find(|e| e.edge == edge)
    }

    /// Mutation-scoped selector: the node's table narrowed by every predicate.
    pub fn selector(&self) -> Selector {
        let mut s = self.node.selector();
        crate::predicate::apply_all(&mut s, &self.predicates);
        s
    }
}

/// A node as returned to callers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Node {
    pub entity: String,
    pub id: Value,
    pub fields: Map<String, Value>,
    /// Edge-scoped join-table columns when this node was loaded through an M2M edge.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub edge_fields: Map<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub edges: BTreeMap<String, Vec<Node>>,
}

impl Node {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn edge(&self, name: &str) -> &[Node] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Result of one mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum MutationOutput {
    Created(Node),
    Affected(u64),
}

impl MutationOutput {
    pub fn node(&self) -> Option<&Node> {
        match self {
            MutationOutput::Created(n) => Some(n),
            MutationOutput::Affected(_) => None,
        }
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            MutationOutput::Created(n) => Some(n),
            MutationOutput::Affected(_) => None,
        }
    }

    /// Primary rows touched: 1 for a create.
    pub fn affected(&self) -> u64 {
        match self {
            MutationOutput::Created(_) => 1,
            MutationOutput::Affected(n) => *n,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryMode {
    #[default]
    All,
    Count,
    Exist,
    Ids,
}

/// Eager-load request for one edge.
#[derive(Clone, Debug)]
pub struct EdgeLoad {
    pub edge: String,
    pub predicates: Vec<Predicate>,
    /// Target node description; without it only target ids are loaded.
    pub target: Option<NodeSpec>,
}

/// A read over one entity type.
#[derive(Clone, Debug)]
pub struct QuerySpec {
    pub node: NodeSpec,
    pub predicates: Vec<Predicate>,
    pub order: Vec<(String, bool)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Projection; `None` selects the id and every declared column.
    pub fields: Option<Vec<String>>,
    pub with_edges: Vec<EdgeLoad>,
    pub mode: QueryMode,
}

impl QuerySpec {
    pub fn new(node: NodeSpec) -> Self {
        QuerySpec {
            node,
            predicates: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            fields: None,
            with_edges: Vec::new(),
            mode: QueryMode::All,
        }
    }

    pub fn entity(&self) -> &str {
        &self.node.entity
    }

    pub fn where_p(mut self, p: Predicate) -> Self {
        self.predicates.push(p);
        self
    }

    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), false));
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), true));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_edge(mut self, edge: &str) -> Self {
        self.with_edges.push(EdgeLoad {
            edge: edge.to_string(),
            predicates: Vec::new(),
            target: None,
        });
        self
    }

    pub fn with_edge_where(mut self, edge: &str, p: Predicate) -> Self {
        match self.with_edges.iter_mut().find(|l| l.edge == edge) {
            Some(l) => l.predicates.push(p),
            None => self.with_edges.push(EdgeLoad {
                edge: edge.to_string(),
                predicates: vec![p],
                target: None,
            }),
        }
        self
    }

    pub fn mode(mut self, mode: QueryMode) -> Self {
        self.mode = mode;
        self
    }
}
