/*!
 * Prelude module for PanelSync Core.
 *
 * Re-exports the types nearly every PanelSync crate needs.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{LightingConfig, Rgb};

pub use crate::event::{BusEvent, EventBus, EventReceiver, SharedEventBus};

pub use crate::config::{
    BrokerSettings, Config, ConfigBuilder, PowerConfig, PowerSourceKind, SettingsChanged,
    SharedConfig,
};

pub use crate::debounce::Debouncer;

pub use crate::utils::{poll_until, spawn_and_log, with_timeout};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
