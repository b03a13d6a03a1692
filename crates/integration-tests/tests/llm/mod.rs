mod bedrock;
mod openai;
mod passthrough;
