mod lifecycle;

pub use lifecycle::{EntityEvent, EntityLifecycle};
