//! Wire types for both sides of the proxy: the Anthropic Messages API this
//! crate exposes (`claude`) and the Gemini-style `generateContent` API it
//! drives upstream (`gemini`), plus the SSE line lexer (`sse`) shared by the
//! streaming reader.

pub mod claude;
pub mod gemini;
pub mod sse;
