//! The pipeline state machine.
//!
//! A session moves through `Input → Analyzing → TopicSelection → Generating → Result`, with
//! `Error` reachable from either in-flight phase. All state changes go through [`transition`],
//! a pure function from `(state, event)` to a new state plus at most one [`Command`] (a stage
//! call to run). Nothing else mutates a [`PipelineState`].
//!
//! Two drivers sit on top:
//! - [`Pipeline::dispatch`] runs commands inline and returns once the session is settled.
//!   This is what the CLI uses.
//! - [`PipelineState::apply`] plus [`StageRunner::run`] let a caller run the stage call
//!   outside of whatever lock guards the state, so concurrent requests observe `Analyzing` /
//!   `Generating` and are rejected by phase. This is what the server uses.
//!
//! Entering `Error` never discards the transcript or analysis, so `retry` resumes at the stage
//! that failed instead of asking the user for input again.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::analysis::{self, Analysis, AnalysisResponse, SuggestedTopics};
use crate::credential::CredentialProvider;
use crate::error::{Error, Result};
use crate::generation::{GenerationService, StructuredClient};
use crate::opts::Opts;
use crate::script::{self, Script};

/// Which screen of the flow a session is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Input,
    Analyzing,
    TopicSelection,
    Generating,
    Result,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Analyzing => "analyzing",
            Self::TopicSelection => "topic_selection",
            Self::Generating => "generating",
            Self::Result => "result",
            Self::Error => "error",
        })
    }
}

/// The two external calls a session can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Analysis => "analysis",
            Self::Synthesis => "synthesis",
        })
    }
}

/// The error artifact: which stage failed and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

/// What a user may ask for. No other inbound events exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Submit(String),
    ChooseTopic(String),
    BackToTopics,
    Reset,
    Retry,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submit(_) => "submit",
            Self::ChooseTopic(_) => "choose_topic",
            Self::BackToTopics => "back_to_topics",
            Self::Reset => "reset",
            Self::Retry => "retry",
        }
    }
}

/// Input to [`transition`]: a user intent or the outcome of a command.
///
/// Completions carry the ticket of the command that produced them.
#[derive(Debug)]
pub enum Event {
    Intent(Intent),
    Analyzed {
        ticket: u64,
        outcome: Result<AnalysisResponse>,
    },
    Synthesized {
        ticket: u64,
        outcome: Result<Script>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Intent(intent) => intent.name(),
            Self::Analyzed { .. } => "analyzed",
            Self::Synthesized { .. } => "synthesized",
        }
    }
}

impl From<Intent> for Event {
    fn from(intent: Intent) -> Self {
        Self::Intent(intent)
    }
}

/// A stage call requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Analyze {
        ticket: u64,
        transcript: String,
    },
    Synthesize {
        ticket: u64,
        transcript: String,
        topic: String,
    },
}

impl Command {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Analyze { .. } => Stage::Analysis,
            Self::Synthesize { .. } => Stage::Synthesis,
        }
    }

    pub fn ticket(&self) -> u64 {
        match self {
            Self::Analyze { ticket, .. } | Self::Synthesize { ticket, .. } => *ticket,
        }
    }

    /// The completion to apply when the command could not run to an outcome of its own.
    pub fn failed(&self, err: Error) -> Event {
        let ticket = self.ticket();
        match self {
            Self::Analyze { .. } => Event::Analyzed {
                ticket,
                outcome: Err(err),
            },
            Self::Synthesize { .. } => Event::Synthesized {
                ticket,
                outcome: Err(err),
            },
        }
    }
}

/// Why an event left the state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The current phase does not accept this event.
    WrongPhase,
    /// The transcript or topic was blank.
    EmptyInput,
    /// A completion for a command that is no longer in flight.
    Stale,
}

/// Result of [`transition`].
#[derive(Debug)]
pub struct Transition {
    pub state: PipelineState,
    pub command: Option<Command>,
    pub rejected: Option<Rejection>,
}

/// One session's phase plus every artifact produced so far.
///
/// Invariants, maintained by [`transition`]:
/// - `analysis` and `suggested_topics` are set together, and only if `transcript` is set
/// - `script` is set only if `analysis` is set
/// - `last_error` is set exactly when the phase is `Error`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    phase: Phase,
    transcript: Option<String>,
    analysis: Option<Analysis>,
    suggested_topics: Option<SuggestedTopics>,
    topic: Option<String>,
    script: Option<Script>,
    last_error: Option<StageFailure>,
    #[serde(skip)]
    ticket: u64,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    pub fn analysis(&self) -> Option<&Analysis> {
        self.analysis.as_ref()
    }

    pub fn suggested_topics(&self) -> Option<&SuggestedTopics> {
        self.suggested_topics.as_ref()
    }

    /// The topic being (or last) synthesized.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn script(&self) -> Option<&Script> {
        self.script.as_ref()
    }

    pub fn last_error(&self) -> Option<&StageFailure> {
        self.last_error.as_ref()
    }

    /// Feed `event` through [`transition`] in place.
    ///
    /// Rejected intents leave the state untouched and surface as [`Error::Rejected`] or
    /// [`Error::EmptyInput`]. Stale completions are dropped silently.
    pub fn apply(&mut self, event: impl Into<Event>) -> Result<Option<Command>> {
        let event = event.into();
        let name = event.name();
        let is_intent = matches!(event, Event::Intent(_));
        let phase = self.phase;

        let t = transition(std::mem::take(self), event);
        *self = t.state;

        match t.rejected {
            None => {
                debug!(event = name, from = %phase, to = %self.phase, "transition");
                Ok(t.command)
            }
            Some(Rejection::Stale) => {
                debug!(event = name, %phase, "dropping stale completion");
                Ok(None)
            }
            Some(Rejection::EmptyInput) => Err(Error::EmptyInput { intent: name }),
            Some(Rejection::WrongPhase) if is_intent => Err(Error::Rejected {
                phase,
                intent: name,
            }),
            Some(Rejection::WrongPhase) => Ok(None),
        }
    }

    fn invariants_hold(&self) -> bool {
        let topics_paired = self.analysis.is_some() == self.suggested_topics.is_some();
        let analysis_needs_transcript = self.analysis.is_none() || self.transcript.is_some();
        let script_needs_analysis = self.script.is_none() || self.analysis.is_some();
        let error_matches_phase = self.last_error.is_some() == (self.phase == Phase::Error);
        topics_paired && analysis_needs_transcript && script_needs_analysis && error_matches_phase
    }

    fn issue_ticket(&mut self) -> u64 {
        self.ticket = self.ticket.wrapping_add(1);
        self.ticket
    }

    /// Back to `Input` with every artifact discarded. The ticket counter survives so that
    /// completions issued before the reset stay stale.
    fn cleared(&self) -> Self {
        Self {
            ticket: self.ticket,
            ..Self::default()
        }
    }
}

/// The transition function. Total: every `(phase, event)` pair either moves the machine or
/// is rejected with the state returned unchanged.
pub fn transition(mut state: PipelineState, event: Event) -> Transition {
    let result = match (state.phase, event) {
        (_, Event::Intent(Intent::Reset)) => applied(state.cleared(), None),

        (Phase::Input, Event::Intent(Intent::Submit(transcript))) => {
            if transcript.trim().is_empty() {
                return rejected(state, Rejection::EmptyInput);
            }
            let ticket = state.issue_ticket();
            let mut next = state.cleared();
            next.phase = Phase::Analyzing;
            next.transcript = Some(transcript.clone());
            applied(next, Some(Command::Analyze { ticket, transcript }))
        }

        (Phase::Analyzing, Event::Analyzed { ticket, outcome }) if ticket == state.ticket => {
            match outcome {
                Ok(resp) => {
                    state.phase = Phase::TopicSelection;
                    state.analysis = Some(resp.analysis);
                    state.suggested_topics = Some(resp.suggested_topics);
                }
                Err(err) => fail(&mut state, Stage::Analysis, &err),
            }
            applied(state, None)
        }

        (Phase::TopicSelection, Event::Intent(Intent::ChooseTopic(topic))) => {
            let topic = topic.trim().to_string();
            if topic.is_empty() {
                return rejected(state, Rejection::EmptyInput);
            }
            let Some(transcript) = state.transcript.clone() else {
                return rejected(state, Rejection::WrongPhase);
            };
            let ticket = state.issue_ticket();
            state.phase = Phase::Generating;
            state.topic = Some(topic.clone());
            applied(
                state,
                Some(Command::Synthesize {
                    ticket,
                    transcript,
                    topic,
                }),
            )
        }

        (Phase::Generating, Event::Synthesized { ticket, outcome }) if ticket == state.ticket => {
            match outcome {
                Ok(script) => {
                    state.phase = Phase::Result;
                    state.script = Some(script);
                }
                Err(err) => fail(&mut state, Stage::Synthesis, &err),
            }
            applied(state, None)
        }

        (Phase::Result, Event::Intent(Intent::BackToTopics)) => {
            state.phase = Phase::TopicSelection;
            state.script = None;
            state.topic = None;
            applied(state, None)
        }

        (Phase::Error, Event::Intent(Intent::Retry)) => retry(state),

        (_, Event::Analyzed { .. } | Event::Synthesized { .. }) => {
            rejected(state, Rejection::Stale)
        }

        (_, Event::Intent(_)) => rejected(state, Rejection::WrongPhase),
    };

    debug_assert!(result.state.invariants_hold(), "{:?}", result.state);
    result
}

fn retry(mut state: PipelineState) -> Transition {
    // Route on the recorded stage; fall back to what the artifacts imply.
    let stage = state.last_error.as_ref().map(|f| f.stage).or_else(|| {
        match (&state.transcript, &state.analysis) {
            (_, Some(_)) => Some(Stage::Synthesis),
            (Some(_), None) => Some(Stage::Analysis),
            (None, None) => None,
        }
    });

    match stage {
        Some(Stage::Analysis) if state.analysis.is_none() => {
            let Some(transcript) = state.transcript.clone() else {
                return applied(state.cleared(), None);
            };
            let ticket = state.issue_ticket();
            state.phase = Phase::Analyzing;
            state.last_error = None;
            applied(state, Some(Command::Analyze { ticket, transcript }))
        }
        Some(Stage::Synthesis) if state.analysis.is_some() => {
            state.phase = Phase::TopicSelection;
            state.last_error = None;
            state.topic = None;
            state.script = None;
            applied(state, None)
        }
        _ => applied(state.cleared(), None),
    }
}

fn fail(state: &mut PipelineState, stage: Stage, err: &Error) {
    warn!(%stage, error = %err, "stage failed");
    state.phase = Phase::Error;
    state.last_error = Some(StageFailure {
        stage,
        message: err.to_string(),
    });
}

fn applied(state: PipelineState, command: Option<Command>) -> Transition {
    Transition {
        state,
        command,
        rejected: None,
    }
}

fn rejected(state: PipelineState, rejection: Rejection) -> Transition {
    Transition {
        state,
        command: None,
        rejected: Some(rejection),
    }
}

/// Runs [`Command`]s against the generation service. Holds no session state.
#[derive(Debug, Clone)]
pub struct StageRunner<S> {
    client: StructuredClient<S>,
    opts: Opts,
}

impl<S: GenerationService> StageRunner<S> {
    pub fn new(service: S, opts: Opts) -> Self {
        Self {
            client: StructuredClient::new(service),
            opts,
        }
    }

    /// Execute `command`, reading the credential now, and wrap the outcome as an [`Event`].
    pub fn run<C: CredentialProvider + ?Sized>(&self, credentials: &C, command: &Command) -> Event {
        let credential = credentials.credential();
        match command {
            Command::Analyze { ticket, transcript } => Event::Analyzed {
                ticket: *ticket,
                outcome: credential
                    .and_then(|cred| analysis::analyze(&self.client, &cred, transcript)),
            },
            Command::Synthesize {
                ticket,
                transcript,
                topic,
            } => Event::Synthesized {
                ticket: *ticket,
                outcome: credential.and_then(|cred| {
                    script::synthesize(&self.client, &self.opts, &cred, transcript, topic)
                }),
            },
        }
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn client(&self) -> &StructuredClient<S> {
        &self.client
    }
}

/// A single session driven synchronously: each intent returns once any stage call it
/// triggered has resolved.
pub struct Pipeline<S, C> {
    runner: StageRunner<S>,
    credentials: C,
    state: PipelineState,
}

impl<S: GenerationService, C: CredentialProvider> Pipeline<S, C> {
    pub fn new(service: S, credentials: C, opts: Opts) -> Self {
        Self {
            runner: StageRunner::new(service, opts),
            credentials,
            state: PipelineState::new(),
        }
    }

    /// Apply `intent`, running any stage call it triggers to completion.
    ///
    /// Stage failures are not returned as errors: they move the session to
    /// [`Phase::Error`]. `Err` means the intent itself was rejected.
    pub fn dispatch(&mut self, intent: Intent) -> Result<Phase> {
        let mut command = self.state.apply(intent)?;
        while let Some(cmd) = command.take() {
            let event = self.runner.run(&self.credentials, &cmd);
            command = self.state.apply(event)?;
        }
        Ok(self.state.phase())
    }

    pub fn submit(&mut self, transcript: impl Into<String>) -> Result<Phase> {
        self.dispatch(Intent::Submit(transcript.into()))
    }

    pub fn choose_topic(&mut self, topic: impl Into<String>) -> Result<Phase> {
        self.dispatch(Intent::ChooseTopic(topic.into()))
    }

    pub fn back_to_topics(&mut self) -> Result<Phase> {
        self.dispatch(Intent::BackToTopics)
    }

    pub fn reset(&mut self) -> Result<Phase> {
        self.dispatch(Intent::Reset)
    }

    pub fn retry(&mut self) -> Result<Phase> {
        self.dispatch(Intent::Retry)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn credentials(&self) -> &C {
        &self.credentials
    }

    pub fn runner(&self) -> &StageRunner<S> {
        &self.runner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationFailure;
    use crate::script::Section;

    fn analyzed() -> AnalysisResponse {
        AnalysisResponse {
            analysis: Analysis {
                hook_strategy: "hook".into(),
                pacing_structure: "pacing".into(),
                retention_techniques: vec!["loop".into()],
                tone_and_style: "tone".into(),
                viral_factors: vec!["factor".into()],
            },
            suggested_topics: ["a".into(), "b".into(), "c".into(), "d".into()],
        }
    }

    fn script() -> Script {
        Script {
            title: "t".into(),
            target_audience: "everyone".into(),
            sections: vec![Section {
                section_name: "Hook".into(),
                visual_cue: "v".into(),
                audio_script: "a".into(),
                estimated_duration: "0:00 - 0:05".into(),
            }],
        }
    }

    fn failure() -> Error {
        Error::Generation(GenerationFailure::EmptyPayload)
    }

    fn step(state: PipelineState, event: impl Into<Event>) -> Transition {
        let t = transition(state, event.into());
        assert!(t.state.invariants_hold(), "{:?}", t.state);
        t
    }

    fn ticket_of(cmd: &Option<Command>) -> u64 {
        match cmd {
            Some(Command::Analyze { ticket, .. }) | Some(Command::Synthesize { ticket, .. }) => {
                *ticket
            }
            None => panic!("expected a command"),
        }
    }

    fn at_topic_selection() -> PipelineState {
        let t = step(PipelineState::new(), Intent::Submit("T".into()));
        let ticket = ticket_of(&t.command);
        step(
            t.state,
            Event::Analyzed {
                ticket,
                outcome: Ok(analyzed()),
            },
        )
        .state
    }

    #[test]
    fn submit_issues_analyze_and_keeps_transcript() {
        let t = step(PipelineState::new(), Intent::Submit("T".into()));
        assert_eq!(t.state.phase(), Phase::Analyzing);
        assert_eq!(t.state.transcript(), Some("T"));
        assert!(matches!(t.command, Some(Command::Analyze { ref transcript, .. }) if transcript == "T"));
    }

    #[test]
    fn aborted_synthesis_lands_in_error_with_topics_kept() {
        let t = step(at_topic_selection(), Intent::ChooseTopic("Space".into()));
        let Some(cmd) = t.command else {
            panic!("expected a command");
        };
        assert_eq!(cmd.ticket(), t.state.ticket);

        let t = step(t.state, cmd.failed(Error::Aborted("worker panicked".into())));
        assert_eq!(t.state.phase(), Phase::Error);
        assert!(t.state.suggested_topics().is_some());
        let failure = t.state.last_error().cloned();
        assert_eq!(failure.as_ref().map(|f| f.stage), Some(Stage::Synthesis));
        assert!(failure.is_some_and(|f| f.message.contains("worker panicked")));
    }

    #[test]
    fn blank_submit_is_rejected() {
        let t = step(PipelineState::new(), Intent::Submit(" \n ".into()));
        assert_eq!(t.rejected, Some(Rejection::EmptyInput));
        assert_eq!(t.state, PipelineState::new());
    }

    #[test]
    fn analysis_failure_keeps_transcript_and_retry_reanalyzes() {
        let t = step(PipelineState::new(), Intent::Submit("T".into()));
        let ticket = ticket_of(&t.command);
        let t = step(
            t.state,
            Event::Analyzed {
                ticket,
                outcome: Err(failure()),
            },
        );
        assert_eq!(t.state.phase(), Phase::Error);
        assert_eq!(t.state.transcript(), Some("T"));
        assert!(t.state.analysis().is_none());
        assert_eq!(t.state.last_error().map(|f| f.stage), Some(Stage::Analysis));

        let t = step(t.state, Intent::Retry);
        assert_eq!(t.state.phase(), Phase::Analyzing);
        assert!(t.state.last_error().is_none());
        assert!(matches!(t.command, Some(Command::Analyze { .. })));
    }

    #[test]
    fn synthesis_failure_retry_returns_to_topics_without_a_command() {
        let t = step(at_topic_selection(), Intent::ChooseTopic(" Space ".into()));
        assert_eq!(t.state.topic(), Some("Space"));
        let ticket = ticket_of(&t.command);
        let t = step(
            t.state,
            Event::Synthesized {
                ticket,
                outcome: Err(failure()),
            },
        );
        assert_eq!(t.state.phase(), Phase::Error);
        assert!(t.state.analysis().is_some());
        assert!(t.state.suggested_topics().is_some());

        let t = step(t.state, Intent::Retry);
        assert_eq!(t.state.phase(), Phase::TopicSelection);
        assert!(t.command.is_none());
        assert!(t.state.topic().is_none());
    }

    #[test]
    fn back_to_topics_discards_only_the_script() {
        let t = step(at_topic_selection(), Intent::ChooseTopic("x".into()));
        let ticket = ticket_of(&t.command);
        let t = step(
            t.state,
            Event::Synthesized {
                ticket,
                outcome: Ok(script()),
            },
        );
        assert_eq!(t.state.phase(), Phase::Result);
        let before = t.state.clone();

        let t = step(t.state, Intent::BackToTopics);
        assert_eq!(t.state.phase(), Phase::TopicSelection);
        assert!(t.state.script().is_none());
        assert_eq!(t.state.analysis(), before.analysis());
        assert_eq!(t.state.suggested_topics(), before.suggested_topics());
    }

    #[test]
    fn reset_clears_everything_from_every_phase() {
        let analyzing = step(PipelineState::new(), Intent::Submit("T".into())).state;
        let topics = at_topic_selection();
        let generating = step(topics.clone(), Intent::ChooseTopic("x".into())).state;

        for state in [PipelineState::new(), analyzing, topics, generating] {
            let t = step(state, Intent::Reset);
            assert!(t.rejected.is_none());
            assert_eq!(t.state.phase(), Phase::Input);
            assert!(t.state.transcript().is_none());
            assert!(t.state.analysis().is_none());
            assert!(t.state.suggested_topics().is_none());
            assert!(t.state.script().is_none());
            assert!(t.state.last_error().is_none());
        }
    }

    #[test]
    fn completion_after_reset_is_stale() {
        let t = step(PipelineState::new(), Intent::Submit("old".into()));
        let old_ticket = ticket_of(&t.command);
        let t = step(t.state, Intent::Reset);
        let t = step(t.state, Intent::Submit("new".into()));
        assert_ne!(ticket_of(&t.command), old_ticket);

        let t = step(
            t.state,
            Event::Analyzed {
                ticket: old_ticket,
                outcome: Ok(analyzed()),
            },
        );
        assert_eq!(t.rejected, Some(Rejection::Stale));
        assert_eq!(t.state.phase(), Phase::Analyzing);
        assert!(t.state.analysis().is_none());
    }

    #[test]
    fn intents_outside_their_phase_are_rejected_unchanged() {
        let analyzing = step(PipelineState::new(), Intent::Submit("T".into())).state;
        let t = step(analyzing.clone(), Intent::Submit("again".into()));
        assert_eq!(t.rejected, Some(Rejection::WrongPhase));
        assert_eq!(t.state, analyzing);

        for intent in [
            Intent::ChooseTopic("x".into()),
            Intent::BackToTopics,
            Intent::Retry,
        ] {
            let t = step(PipelineState::new(), intent);
            assert_eq!(t.rejected, Some(Rejection::WrongPhase));
        }
    }

    #[test]
    fn apply_maps_rejections_to_errors() {
        let mut state = PipelineState::new();
        assert!(matches!(
            state.apply(Intent::Retry),
            Err(Error::Rejected {
                phase: Phase::Input,
                intent: "retry"
            })
        ));
        assert!(matches!(
            state.apply(Intent::Submit(String::new())),
            Err(Error::EmptyInput { intent: "submit" })
        ));
        assert_eq!(state, PipelineState::new());
    }
}
