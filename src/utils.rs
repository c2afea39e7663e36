pub mod llm;
pub mod string;
pub mod token;
pub mod trim;
