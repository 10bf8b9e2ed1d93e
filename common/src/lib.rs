pub mod draft;
pub mod engine;
pub mod error;
pub mod forge;
pub mod metal;
pub mod platform;
pub mod protocol;
pub mod spec;
pub mod sql;

pub use draft::{draft, Draft, DraftBuilder};
pub use error::{MetalError, MetalResult};
pub use forge::{ForgeMaster, ForgeMode, Forged, Platform};
pub use metal::{Metal, MetalKind, MetalProps};
pub use platform::LocalPlatform;
pub use protocol::{
    control_address, Analysis, ApiResponse, BackendEvent, BackendReport, BackendState,
    DraftSummary, ExecAccepted, ExecReport, ExecState, MetalSchema,
};
pub use spec::Spec;
