/// Google Generative Language (Gemini) backend.
#[cfg(feature = "gemini")]
pub mod gemini;
