pub mod gemini;
pub mod instruction;
pub mod ollama;
pub mod parse;

pub use gemini::GeminiBackend;
pub use ollama::OllamaBackend;
