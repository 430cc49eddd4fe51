// ABOUTME: Node tree module - declarations and the validated query plan
// ABOUTME: A node tree describes which tables and columns compose one document

pub mod declaration;
pub mod plan;

pub use declaration::{Node, Transform, NODE_ATTRIBUTES};
pub use plan::{Join, JoinKind, NodePlan, PlanNode, META_FIELD};
