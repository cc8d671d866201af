//! Output-context management: token budgeting, rolling-window and
//! defensive pruning, tool-output shrinking, control-token scrubbing, and
//! the `<tool_call>` syntax healer.
//!
//! Everything here is a pure function over message slices, except
//! [`shrink::shrink_tool_output`] which may call an injected summarizer.

pub mod heal;
pub mod json;
pub mod scrub;
pub mod shrink;
pub mod tokens;
pub mod window;

pub use heal::heal_tool_call_syntax;
pub use json::extract_json;
pub use scrub::scrub;
pub use shrink::{shrink_tool_output, truncate_middle, Summarize};
pub use tokens::{CharEstimator, TokenEstimator};
pub use window::{emergency_prune, prune, rolling_window};
