pub mod llm;
pub mod token;
