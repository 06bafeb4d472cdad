use serde::{Deserialize, Serialize};

/// Tunables for a [super::Runtime].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How many released handles are kept mapped for reuse. Zero disables the idle cache.
    pub handle_cache_len: usize,
    /// Per-handle bound on cached FOT resolutions. Zero disables the resolution cache.
    pub fot_cache_len: usize,
    /// Run `ASYNC_DURABLE` syncs on a background flusher thread. When off, they block like
    /// `DURABLE` ones.
    pub async_durability: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            handle_cache_len: 32,
            fot_cache_len: 16,
            async_durability: true,
        }
    }
}
