//! Initial bootstrap: drive the monitor until the first map is accepted.

use crate::monitor::Confmon;
use crate::snapshot::ConfigInfo;
use crate::util::ConfmonError;
use log::{info, warn};
use std::sync::Arc;

impl Confmon {
    /// Runs refresh cycles until a map is accepted, every provider has
    /// failed, or `config_timeout` passes.
    ///
    /// A monitor that already holds a map and is idle returns it at once.
    /// On timeout the cycle keeps running, so a later call picks up where
    /// this one stopped waiting.
    pub async fn bootstrap(&mut self) -> Result<Arc<ConfigInfo>, ConfmonError> {
        if let (Some(config), false) = (self.config(), self.is_refreshing()) {
            return Ok(Arc::clone(config));
        }
        let waited = self.settings().config_timeout;
        info!(
            "event=bootstrap_start bucket={} timeout_ms={}",
            self.settings().bucket,
            waited.as_millis()
        );
        self.start(false);
        match tokio::time::timeout(waited, self.wait_for_cycle()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("event=bootstrap_timeout waited_ms={}", waited.as_millis());
                Err(ConfmonError::BootstrapTimeout { waited })
            }
        }
    }

    async fn wait_for_cycle(&mut self) -> Result<Arc<ConfigInfo>, ConfmonError> {
        loop {
            if !self.is_refreshing() {
                return match self.config() {
                    Some(config) => {
                        info!(
                            "event=bootstrap_complete origin={} rev={:?}",
                            config.origin(),
                            config.revision()
                        );
                        Ok(Arc::clone(config))
                    }
                    None => Err(ConfmonError::Exhausted {
                        last: self.last_error().cloned(),
                    }),
                };
            }
            self.pump().await?;
        }
    }
}
