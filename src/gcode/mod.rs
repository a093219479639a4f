pub mod builtin_macros;
pub mod executor;
pub mod macros;
pub mod parser;
pub mod state;
pub mod template;

pub use executor::{Dispatch, ExecutorContext, ExecutorError, PendingResponse};
pub use macros::{CustomMacro, Macro, MacroError, MacroInvocation, MacroManager};
pub use state::{GcodeState, RestoreOptions};
