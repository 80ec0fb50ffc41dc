use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

/// Largest value the per blob `notfounds` counter may reach.
pub const MAX_NOTFOUNDS: u8 = 40;
//                                      ms    s    m    h    d
const MONTH: Duration = Duration::from_millis(1000 * 60 * 60 * 24 * 30);

/// Configuration of the replication engine.
#[serde_as]
#[derive(PartialEq, Eq, Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of simultaneous downloads.
    pub download_concurrency: usize,
    /// Base delay before the download job re-arms itself, jittered by +-50%.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub download_delay: Duration,
    /// Links whose message is further than this from now are ignored.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_link_age: Duration,
    /// Upper bound of the per blob `notfounds` counter.
    pub max_notfounds: u8,
    /// Capacity of the registry event bus.
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_concurrency: 5,
            download_delay: Duration::from_millis(300),
            max_link_age: MONTH,
            max_notfounds: MAX_NOTFOUNDS,
            event_buffer: 1024,
        }
    }
}
