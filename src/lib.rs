// 导出模块
pub mod klcommon;
pub mod kldata;

// Re-export error types
pub use klcommon::error::AppError;
