// Export all route modules
pub mod research;

// Re-export all route handlers for easy importing
pub use research::*;
