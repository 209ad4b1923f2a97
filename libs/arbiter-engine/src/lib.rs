pub mod comparator;
pub mod executor;
pub mod feedback;
pub mod grader;
pub mod languages;
pub mod memory;
pub mod sandbox;
pub mod screener;

pub use executor::{Executor, ExecutorSettings, PreparedProgram, SandboxExecutor};
pub use grader::Grader;
pub use languages::{LanguageAvailability, LanguageConfigManager};
pub use screener::{screen, SafetyViolation};
