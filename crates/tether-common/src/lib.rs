pub mod resource;
pub mod status;
pub mod telemetry;

pub use resource::{ListCodecError, Object, ObjectList, ObjectMeta, ResourceKind, UnsupportedResource};
pub use telemetry::{LogFormat, TelemetryConfig};
pub use status::{Status, StatusDetails, StatusReason};
