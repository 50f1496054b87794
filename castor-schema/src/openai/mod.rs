mod chat_request;
mod chat_response;
mod model_list;

pub use chat_request::{ChatCompletionRequest, ChatMessage};
pub use chat_response::{ChatChoice, ChatCompletion, ChatCompletionChunk, ChatDelta, ChatUsage};
pub use model_list::{OpenaiModel, OpenaiModelList};
