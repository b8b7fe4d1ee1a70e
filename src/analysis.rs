//! Analysis stage: deconstruct a transcript and propose topics that fit its formula.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::generation::{GenerationService, StructuredClient};
use crate::schema::Schema;

/// Number of topics the analysis stage always proposes.
pub const SUGGESTED_TOPIC_COUNT: usize = 4;

const SYSTEM_INSTRUCTION: &str = "\
You are an expert YouTube Script Consultant.
Your goal is to deconstruct viral videos to understand WHY they work, and then suggest new \
topics that would fit that specific successful formula.
Analyze the provided transcript for its structural secrets (hook, pacing, retention).
Then, brainstorm 4 creative, viral-worthy topics that would work perfectly with this specific \
structure.";

/// The structural "success formula" of a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Analysis {
    pub hook_strategy: String,
    pub pacing_structure: String,
    pub retention_techniques: Vec<String>,
    pub tone_and_style: String,
    pub viral_factors: Vec<String>,
}

/// Exactly four topic suggestions, in the order the service ranked them.
pub type SuggestedTopics = [String; SUGGESTED_TOPIC_COUNT];

/// Everything the analysis stage produces in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnalysisResponse {
    pub analysis: Analysis,
    pub suggested_topics: SuggestedTopics,
}

/// The closed response schema for the analysis stage.
pub fn analysis_schema() -> Schema {
    let analysis = Schema::object([
        (
            "hookStrategy",
            Schema::string().describe("Analysis of the opening hook"),
        ),
        (
            "pacingStructure",
            Schema::string().describe("How the video flows speed-wise"),
        ),
        (
            "retentionTechniques",
            Schema::array(Schema::string())
                .min_items(1)
                .describe("List of tricks used to keep viewers watching"),
        ),
        (
            "toneAndStyle",
            Schema::string().describe("The emotional vibe of the script"),
        ),
        (
            "viralFactors",
            Schema::array(Schema::string())
                .min_items(1)
                .describe("Key reasons this script likely went viral"),
        ),
    ]);

    Schema::object([
        ("analysis", analysis),
        (
            "suggestedTopics",
            Schema::array(Schema::string())
                .items_between(SUGGESTED_TOPIC_COUNT, SUGGESTED_TOPIC_COUNT)
                .describe("4 viral topic suggestions based on the analysis"),
        ),
    ])
}

pub fn system_instruction() -> &'static str {
    SYSTEM_INSTRUCTION
}

/// Build the user prompt that embeds `transcript`.
pub fn user_prompt(transcript: &str) -> String {
    format!(
        r#"Analyze this Viral YouTube Transcript:
"""
{transcript}
"""

1. Analyze the Hook, Pacing, Retention techniques, Tone, and Viral Factors.
2. Suggest {SUGGESTED_TOPIC_COUNT} distinct, high-potential topics that would work well with this script's structure.
   - If it's a storytelling script, suggest compelling stories.
   - If it's educational, suggest popular "how-to" or "explained" topics.
   - The topics should be catchy and diverse.

Output JSON."#
    )
}

/// Run the analysis stage.
///
/// Fails with [`crate::Error::MissingCredential`] (no request made) or
/// [`crate::Error::Generation`]; never returns a partial result.
pub fn analyze<S: GenerationService>(
    client: &StructuredClient<S>,
    credential: &str,
    transcript: &str,
) -> Result<AnalysisResponse> {
    info!(transcript_len = transcript.len(), "analyzing transcript");
    let response: AnalysisResponse = client.invoke(
        credential,
        system_instruction(),
        &user_prompt(transcript),
        &analysis_schema(),
    )?;
    info!(topics = response.suggested_topics.len(), "analysis complete");
    Ok(response)
}
