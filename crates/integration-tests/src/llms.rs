pub mod bedrock;
pub mod openai;
mod provider;

pub use bedrock::BedrockMock;
pub use openai::{OpenAIMock, Recorded, Requests};
pub use provider::{LlmProviderConfig, ProviderType, TestLlmProvider};
