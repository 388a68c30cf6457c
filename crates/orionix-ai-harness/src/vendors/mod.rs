/// OpenAI-compatible chat completions (OpenAI, DeepSeek, Qwen presets).
pub mod openai_compat;
/// Scripted in-process provider for tests and offline runs.
pub mod scripted;
