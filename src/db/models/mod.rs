pub mod drift;
pub mod host;
pub mod iac;
pub mod runtime;
pub mod scan_log;
pub mod settings;
pub mod stamp;

pub use drift::{compare_drift, detect_orphan_runtime_projects, DriftKind, StackDriftCache};
pub use host::{Host, NewHost};
pub use iac::{
    DeployKind, DiscoveredFile, DiscoveredService, DiscoveredStack, FileRole, IacFile, IacRepo,
    IacService, IacStack, RepoKind, ScopeKind, SopsStatus,
};
pub use runtime::{Container, ContainerPort, RuntimeStack, ScannedContainer};
pub use scan_log::ScanLog;
pub use settings::{AppSetting, GroupSetting, HostSetting, SettingsCache};
pub use stamp::{DeploymentStamp, DeploymentStatus};
