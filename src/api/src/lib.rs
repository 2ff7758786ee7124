//! # permsync API
//!
//! Stable data model for the permsync permission engine: subjects, nodes,
//! context sets, inheritance edges, invalidation events and the shared error
//! taxonomy. Host adapters compile against this crate only.
//!
//! ## Example
//!
//! ```rust
//! use permsync_api::{ContextSet, Node, Subject, SubjectDiff, SubjectId};
//!
//! let fly = Node::builder("fly.use")
//!     .context("world=creative".parse().unwrap())
//!     .build()
//!     .unwrap();
//!
//! let vip = Subject::new(SubjectId::group("vip").unwrap());
//! let (vip, changed) = vip.apply_diff(&SubjectDiff::new().add(fly));
//! assert!(changed);
//!
//! let creative: ContextSet = "world=creative".parse().unwrap();
//! assert_eq!(vip.active_nodes(&creative, chrono::Utc::now()).count(), 1);
//! ```

pub mod context;
pub mod error;
pub mod event;
pub mod node;
pub mod subject;

pub use context::{ContextError, ContextSet, Specificity};
pub use error::{PermsError, Result};
pub use event::{InvalidationEvent, InvalidationScope};
pub use node::{Node, NodeBuilder, NodeError, NodeKind, Tristate};
pub use subject::{InheritanceEdge, Subject, SubjectDiff, SubjectId, SubjectKind};
