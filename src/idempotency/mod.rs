pub mod context;
pub mod guard;
pub mod mode;
pub mod record;
pub mod result_cache;
pub mod token;
pub mod translate;

pub use context::{classify, CallerKind, InboundRequest, Invocation, MessageEnvelope};
pub use guard::{backoff, GuardStats, IdempotencyGuard, StatsSnapshot};
pub use mode::{resolve, IdempotentOptions, ResolvedMode};
pub use record::{RecordKeys, RecordState};
pub use result_cache::ResultCache;
pub use token::{resolve_token, OperationParams, TokenExpression};
pub use translate::{translate, Rejection};
