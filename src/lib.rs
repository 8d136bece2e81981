//! entgraph: entity-graph mutation compiler and privacy policy engine over SQL stores.

pub mod case;
pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hook;
pub mod migration;
pub mod predicate;
pub mod privacy;
pub mod service;
pub mod sql;

pub use config::{load_resolved, load_schema_file, load_schema_str, resolve, EngineSettings, ResolvedEntity, ResolvedSchema};
pub use context::{cancel_pair, CancelHandle, Context, Viewer};
pub use driver::{ensure_database_exists, Driver, PgDriver, Session, SqliteDriver};
pub use engine::{Engine, EngineBuilder, QueryOutput};
pub use error::{ConfigError, ConstraintKind, ConstraintViolation, ErrorKind, GraphError};
pub use graph::{MutationOutput, MutationSpec, Node, NodeSpec, Op, QueryMode, QuerySpec};
pub use hook::{Chain, Interceptor, Mutator, Next};
pub use migration::create_tables;
pub use predicate::Predicate;
pub use privacy::{Decision, EntityPolicy, PolicyPlacement, PolicyRegistry, Rule, Verdict};
