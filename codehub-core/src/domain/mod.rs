pub mod session;
pub mod workspace;

pub use session::{Session, User};
pub use workspace::{
    ArchiveCondition, ArchiveFailureReason, ContainerCondition, Conditions, DesiredState,
    ErrorReason, Operation, Phase, RestoreCondition, VolumeCondition, Workspace,
};
