//! Language-model backed stage workers: question extraction from transcripts
//! and cited answer drafting against a local knowledge base.

pub mod answer;
pub mod extract;
pub mod knowledge;
pub mod llm;

pub use answer::AnswerWorker;
pub use extract::{ExtractWorker, speakers_from_csv};
pub use knowledge::{Hit, KnowledgeBase, KnowledgeError, Page};
pub use llm::{LanguageModel, LlmClient, LlmConfig, LlmError, strip_code_fences};
