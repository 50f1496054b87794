pub mod codeassist;
pub mod gemini;
pub mod openai;

pub use codeassist::{CodeAssistEnvelope, CodeAssistResponseBody};
pub use gemini::{GeminiGenerateContentRequest, GeminiModelList, GeminiResponseBody};
pub use openai::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, OpenaiModelList,
};
