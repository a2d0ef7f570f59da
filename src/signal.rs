use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::config::NodeConfig;

/// Re-read the config file into `config`. On failure the old snapshot stays.
pub fn reload_config(config: &ArcSwap<NodeConfig>, path: &Path) -> bool {
    match NodeConfig::from_file(path) {
        Ok(new) => {
            info!(path = %path.display(), hwaddr = %new.hwaddr, use_dhcp = new.use_dhcp, "reloaded config, applies at next link up");
            config.store(Arc::new(new));
            true
        }
        Err(e) => {
            error!(%e, path = %path.display(), "failed to reload config, keeping previous");
            false
        }
    }
}

/// Spawn a thread that handles SIGHUP by reloading the node config from disk
pub fn spawn_sighup_handler(
    config: Arc<ArcSwap<NodeConfig>>,
    path: PathBuf,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let mut signals = Signals::new([SIGHUP])?;
    std::thread::Builder::new()
        .name("sighup".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                if sig == SIGHUP {
                    info!("received SIGHUP, reloading config");
                    reload_config(&config, &path);
                }
            }
        })
}
