//! Analysis components: the reasoning-backend client and the rule-based
//! fallback analyzer that stands in for it when it fails.

pub mod backend;
pub mod fallback;

pub use backend::{AnalysisContext, BackendError, Exchange, HttpBackend, ReasoningBackend};
pub use fallback::{FallbackAnalyzer, KEEP_GOING, MIN_CODE_LEN};
