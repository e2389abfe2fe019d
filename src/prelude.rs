//! Convenience re-exports for client code. Pull this module in via
//! `use confmon::prelude::*;` to get the monitor, its settings and the
//! snapshot types without walking the module tree.

pub use crate::hostlist::{HostPort, Hostlist};
pub use crate::listener::{ConfigEvent, Listener};
pub use crate::monitor::{Confmon, RefreshOptions};
pub use crate::provider::ProviderKind;
pub use crate::settings::Settings;
pub use crate::snapshot::ConfigInfo;
pub use crate::util::error::{ConfigError, ConfmonError};
pub use crate::vbucket::{ServiceMode, ServiceType, VbucketConfig};
