//! Prop metadata: validated records and the revisioned registry.

pub mod record;
pub mod registry;

pub use record::{HandGrip, HandGripDraft, PropDraft, PropRecord, StoredProp, Vec3};
pub use registry::PropRegistry;
