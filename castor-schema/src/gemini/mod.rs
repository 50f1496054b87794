mod content;
mod model_list;
mod request;
mod response;

pub use content::{Content, Part};
pub use model_list::{GeminiModel, GeminiModelList};
pub use request::{GeminiGenerateContentRequest, GenerationConfig, Tool, ToolConfig};
pub use response::{Candidate, GeminiResponseBody};
