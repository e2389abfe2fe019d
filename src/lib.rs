//! Cluster topology acquisition for partitioned key-value clients.
//! The [`Confmon`] monitor obtains the partition map from a set of
//! pluggable providers, keeps the freshest one and tells listeners when it
//! changes.

pub mod bootstrap;
pub mod hostlist;
pub mod io;
pub mod listener;
pub mod monitor;
pub mod prelude;
pub mod proto;
pub mod provider;
pub mod settings;
pub mod snapshot;
pub mod throttle;
pub mod timeouts;
pub mod util;
pub mod vbucket;

pub use hostlist::{HostPort, Hostlist};
pub use io::{BoxedStream, Connector, EventSender, LoopEvent, TcpConnector};
pub use listener::{ConfigEvent, Listener};
pub use monitor::{Confmon, MonitorState, RefreshOptions, RefreshRequest};
pub use provider::{
    AnyProvider, CccpProvider, FileCacheWriter, FileProvider, HttpProvider, Provider,
    ProviderKind, StaticMode, StaticProvider, CACHE_MAGIC,
};
pub use settings::{load_settings, ConnectionType, HttpUrlMode, Settings};
pub use snapshot::{CompareClock, ConfigInfo};
pub use throttle::{RefreshThrottle, ThrottleDecision};
pub use util::{ConfigError, ConfmonError, ErrorClass, HostParseError, SettingsError, VbucketError};
pub use vbucket::{ConfigDiff, Distribution, Server, ServiceMode, ServiceType, VbucketConfig};
