// ABOUTME: Transport-agnostic core of the gateway control plane
// ABOUTME: Wire protocol types, run registry, dedupe cache, config, reload planning, sessions

pub mod config;
pub mod dedupe;
pub mod metrics;
pub mod protocol;
pub mod reload;
pub mod runs;
pub mod session;

// Re-export the types most callers need
pub use config::{AuthMode, Config, GatewayConfig, ProvidersConfig};
pub use dedupe::{CachedOutcome, DedupeCache};
pub use protocol::{
    negotiate_protocol, AuthParams, ClientInfo, ClientMode, ConnectParams, ErrorCode, ErrorShape,
    Frame, HelloOk, PROTOCOL_VERSION,
};
pub use reload::{build_reload_plan, diff_config_paths, ReloadPlan};
pub use runs::{AbortOutcome, ChatRunRegistry};
pub use session::{ChatMessage, SendPolicy, SessionRecord, SessionStore};
