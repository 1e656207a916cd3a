//! The research pipeline. The orchestrator drives four phases in order:
//! link discovery, page selection, concurrent fetch and extraction, and
//! AI synthesis of the extracted text into structured fields.

pub mod analysis;
pub mod discovery;
pub mod extraction;
pub mod fetch;
pub mod orchestrator;
pub mod selection;

pub use analysis::{AiAnalyzer, AnalysisOutcome};
pub use discovery::LinkDiscoverer;
pub use extraction::{extract_content, ExtractedContent};
pub use fetch::FetchPool;
pub use orchestrator::Orchestrator;
pub use selection::PageSelector;
