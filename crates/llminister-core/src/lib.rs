pub mod artifact;
pub mod citation;
pub mod match_key;
pub mod merge;
pub mod payload;
pub mod question;
pub mod stage;

pub use artifact::Artifact;
pub use citation::{AnswerData, Citation, CitationError, Sentence, Source, resolve};
pub use match_key::normalize_question;
pub use merge::{MergeOutcome, apply_patch, merge_into, new_question};
pub use payload::{QuestionBatch, Transcript, Utterance};
pub use question::{Answer, IncomingQuestion, Question, QuestionPatch, QuestionStatus};
pub use stage::{StageKind, UnknownStage};
