/// Options that control how scripts are generated.
///
/// This struct represents *library-level configuration*, not CLI flags directly.
/// The CLI and server map user input into this type so that other frontends (tests, batch
/// jobs) can construct options programmatically.
#[derive(Debug, Clone, Default)]
pub struct Opts {
    /// Language the new script should be written in (e.g. `"Korean (Hangul)"`).
    ///
    /// When `None`, the script is written in the same language as the original transcript.
    pub output_language: Option<String>,
}

impl Opts {
    pub fn with_output_language(mut self, language: impl Into<String>) -> Self {
        let language = language.into();
        self.output_language = (!language.trim().is_empty()).then(|| language.trim().to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_language_means_unset() {
        assert_eq!(Opts::default().with_output_language("  ").output_language, None);
        assert_eq!(
            Opts::default()
                .with_output_language(" English ")
                .output_language
                .as_deref(),
            Some("English")
        );
    }
}
