/// The supported output formats for a generated script.
///
/// Each variant maps to a concrete `ScriptEncoder` implementation. With the `cli` feature the
/// enum doubles as a `clap` flag value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum OutputType {
    /// The `newScript` object as pretty-printed JSON.
    Json,

    /// A plain-text shooting script, one block per section.
    #[default]
    Text,
}
