//! Wire formats used by the network providers.

pub mod http;
pub mod mcbp;
