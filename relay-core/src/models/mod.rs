pub mod rate_limit;
pub mod session;
pub mod work;

pub use rate_limit::{LimitSpec, RateLimitResult};
pub use session::{ConversationItem, ItemRole, Session, SessionChange, SessionDelta, SessionStatus};
pub use work::{
    CancelSignal, PromptMessage, ResultPayload, ResultStatus, WorkFailure, WorkItem, WorkKind,
    WorkPayload, WorkResult,
};
