//! Script synthesis stage: write a new script for a topic by cloning the structure of an
//! original transcript.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::generation::{GenerationService, StructuredClient};
use crate::opts::Opts;
use crate::schema::Schema;

const SYSTEM_INSTRUCTION: &str = "\
You are a creative YouTube Scriptwriter.
Your task is to take a \"New Topic\" and write a script for it by cloning the structural \
formula of an \"Original Transcript\".
You must strictly follow the original's pacing, hook style, tone, and transition techniques, \
but apply them to the new subject matter.";

/// One beat of a script. Sections are in playback order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Section {
    /// e.g. "Hook", "Body 1", "Climax".
    pub section_name: String,
    /// What should be on screen.
    pub visual_cue: String,
    /// What the narrator says.
    pub audio_script: String,
    /// e.g. "0:00 - 0:15".
    pub estimated_duration: String,
}

/// A generated script. `sections` is never empty and its order is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Script {
    pub title: String,
    pub target_audience: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ScriptResponse {
    new_script: Script,
}

/// The closed response schema for the synthesis stage.
pub fn script_schema() -> Schema {
    let section = Schema::object([
        (
            "sectionName",
            Schema::string().describe("e.g., Hook, Body 1, Climax"),
        ),
        (
            "visualCue",
            Schema::string().describe("Description of what should be on screen"),
        ),
        (
            "audioScript",
            Schema::string().describe("What the narrator says"),
        ),
        (
            "estimatedDuration",
            Schema::string().describe("e.g., '0:00 - 0:15'"),
        ),
    ]);

    let new_script = Schema::object([
        (
            "title",
            Schema::string().describe("Clickbait-worthy title for the new video"),
        ),
        ("targetAudience", Schema::string()),
        ("sections", Schema::array(section).min_items(1)),
    ]);

    Schema::object([("newScript", new_script)])
}

/// The system instruction, including the output-language line.
pub fn system_instruction(opts: &Opts) -> String {
    let language = opts
        .output_language
        .as_deref()
        .unwrap_or("the same language as the Original Transcript");
    format!("{SYSTEM_INSTRUCTION}\nLanguage: {language}.")
}

/// Build the user prompt that embeds the original transcript and the new topic.
pub fn user_prompt(original_transcript: &str, topic: &str) -> String {
    format!(
        r#"Original Viral Transcript (Template):
"""
{original_transcript}
"""

New Topic to write about:
"""
{topic}
"""

Write a FULL script for the new topic.
- Match the exact length and section breakdown of the original.
- Keep the same number of sections, in the same order, with the same relative timing.
- If the original tells a joke at 0:30, the new one should too.
- If the original uses a fast montage at 1:00, the new one should too.

Output JSON."#
    )
}

/// Run the synthesis stage.
///
/// Fails with [`crate::Error::MissingCredential`] (no request made) or
/// [`crate::Error::Generation`].
pub fn synthesize<S: GenerationService>(
    client: &StructuredClient<S>,
    opts: &Opts,
    credential: &str,
    original_transcript: &str,
    topic: &str,
) -> Result<Script> {
    info!(%topic, "synthesizing script");
    let response: ScriptResponse = client.invoke(
        credential,
        &system_instruction(opts),
        &user_prompt(original_transcript, topic),
        &script_schema(),
    )?;
    let script = response.new_script;
    info!(sections = script.sections.len(), title = %script.title, "script complete");
    Ok(script)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> serde_json::Value {
        json!({
            "newScript": {
                "title": "Why Mars?",
                "targetAudience": "Space fans",
                "sections": [
                    {
                        "sectionName": "Hook",
                        "visualCue": "Rocket launch",
                        "audioScript": "What if we left tomorrow?",
                        "estimatedDuration": "0:00 - 0:10"
                    },
                    {
                        "sectionName": "Body",
                        "visualCue": "Red dunes",
                        "audioScript": "Mars is cold.",
                        "estimatedDuration": "0:10 - 0:50"
                    }
                ]
            }
        })
    }

    #[test]
    fn schema_accepts_a_complete_script() {
        assert_eq!(script_schema().validate(&sample()), Ok(()));
    }

    #[test]
    fn schema_rejects_empty_sections() {
        let mut value = sample();
        value["newScript"]["sections"] = json!([]);
        assert!(script_schema().validate(&value).is_err());
    }

    #[test]
    fn schema_reports_the_offending_section_field() {
        let mut value = sample();
        value["newScript"]["sections"][1]["visualCue"] = json!(null);
        let err = script_schema().validate(&value).unwrap_err();
        assert_eq!(err.path, "$.newScript.sections[1].visualCue");
    }

    #[test]
    fn system_instruction_defaults_to_transcript_language() {
        let text = system_instruction(&Opts::default());
        assert!(text.ends_with("Language: the same language as the Original Transcript."));

        let korean = Opts::default().with_output_language("Korean (Hangul)");
        assert!(system_instruction(&korean).ends_with("Language: Korean (Hangul)."));
    }

    #[test]
    fn prompt_embeds_transcript_and_topic() {
        let prompt = user_prompt("T", "Space travel");
        assert!(prompt.contains("\"\"\"\nT\n\"\"\""));
        assert!(prompt.contains("\"\"\"\nSpace travel\n\"\"\""));
    }
}
