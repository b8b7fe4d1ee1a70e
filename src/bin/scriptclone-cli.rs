use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use scriptclone::backends::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use scriptclone::script_encoder::encoder_for;
use scriptclone::{
    CredentialProvider, FileCredential, GeminiConfig, GeminiService, MemoryCredential, Opts,
    OutputType, Phase, Pipeline, PipelineState,
};

type CliPipeline = Pipeline<GeminiService, Arc<dyn CredentialProvider>>;

#[derive(Parser, Debug)]
#[command(name = "scriptclone")]
#[command(about = "Analyze a successful video transcript and clone its structure onto a new topic")]
struct Params {
    /// Transcript file. Reads stdin when omitted.
    #[arg(short = 'i', long = "transcript")]
    transcript: Option<PathBuf>,

    /// Topic to write about: free text, or 1-4 to pick a suggested topic.
    /// When set, the CLI exits after printing the script.
    #[arg(short = 't', long = "topic")]
    topic: Option<String>,

    /// API key for the generation service.
    #[arg(long = "api-key", env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// File to load a remembered API key from.
    #[arg(long = "key-file")]
    key_file: Option<PathBuf>,

    /// Save `--api-key` into `--key-file` for later runs. Requires a non-empty key.
    #[arg(long = "remember", default_value_t = false, requires = "key_file")]
    remember: bool,

    #[arg(long = "model", env = "SCRIPTCLONE_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long = "base-url", env = "SCRIPTCLONE_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Per-request timeout in seconds.
    #[arg(long = "timeout", default_value_t = 60)]
    timeout_secs: u64,

    /// Language to write the new script in. Defaults to the transcript's language.
    #[arg(short = 'l', long = "language")]
    language: Option<String>,

    #[arg(
        short = 'o',
        long = "output-type",
        value_enum,
        default_value_t = OutputType::Text
    )]
    output_type: OutputType,
}

fn main() -> Result<()> {
    scriptclone::logging::init();
    let params = Params::parse();

    let credentials = get_credentials(&params)?;
    let service = GeminiService::new(GeminiConfig {
        model: params.model.clone(),
        base_url: params.base_url.clone(),
        timeout: Duration::from_secs(params.timeout_secs),
    })
    .context("failed to initialize generation client")?;

    let mut opts = Opts::default();
    if let Some(language) = &params.language {
        opts = opts.with_output_language(language.as_str());
    }

    let transcript = read_transcript(params.transcript.as_ref())?;
    let interactive = params.topic.is_none();
    if interactive && !io::stdin().is_terminal() {
        bail!("pass --topic when the transcript is piped on stdin");
    }

    let mut pipeline = Pipeline::new(service, credentials, opts);
    if !transcript.trim().is_empty() {
        pipeline.submit(transcript)?;
    } else if !interactive {
        bail!("transcript is empty");
    }
    run(&mut pipeline, params.topic, params.output_type, interactive)
}

fn run(
    pipeline: &mut CliPipeline,
    mut topic: Option<String>,
    output_type: OutputType,
    interactive: bool,
) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        match pipeline.phase() {
            Phase::TopicSelection => {
                print_analysis(pipeline.state())?;
                let raw = match topic.take() {
                    Some(t) => t,
                    None => prompt(&mut lines, "Topic (1-4 or your own): ")?,
                };
                let chosen = resolve_topic(pipeline.state(), &raw);
                if let Err(err) = pipeline.choose_topic(chosen) {
                    eprintln!("{err}");
                }
            }
            Phase::Result => {
                if let Some(script) = pipeline.state().script() {
                    let mut encoder = encoder_for(output_type, io::stdout().lock());
                    encoder.write_script(script)?;
                    encoder.close()?;
                }
                if !interactive {
                    return Ok(());
                }
                match prompt(&mut lines, "[b]ack to topics, [n]ew transcript, [q]uit: ")?.as_str() {
                    "b" => {
                        pipeline.back_to_topics()?;
                    }
                    "n" => {
                        pipeline.reset()?;
                    }
                    "q" => return Ok(()),
                    _ => {}
                }
            }
            Phase::Error => {
                let message = pipeline
                    .state()
                    .last_error()
                    .map(|f| format!("{} failed: {}", f.stage, f.message))
                    .unwrap_or_else(|| "stage failed".to_string());
                if !interactive {
                    bail!(message);
                }
                eprintln!("{message}");
                match prompt(&mut lines, "[r]etry, [n]ew transcript, [q]uit: ")?.as_str() {
                    "r" => {
                        pipeline.retry()?;
                    }
                    "n" => {
                        pipeline.reset()?;
                    }
                    "q" => return Ok(()),
                    _ => {}
                }
            }
            Phase::Input => {
                eprintln!("Paste a transcript, then an empty line:");
                let mut transcript = String::new();
                for line in lines.by_ref() {
                    let line = line?;
                    if line.trim().is_empty() && !transcript.is_empty() {
                        break;
                    }
                    transcript.push_str(&line);
                    transcript.push('\n');
                }
                if transcript.trim().is_empty() {
                    return Ok(());
                }
                pipeline.submit(transcript)?;
            }
            phase @ (Phase::Analyzing | Phase::Generating) => {
                bail!("pipeline unexpectedly left in {phase}");
            }
        }
    }
}

fn get_credentials(params: &Params) -> Result<Arc<dyn CredentialProvider>> {
    let api_key = params.api_key.clone().unwrap_or_default();

    let Some(path) = &params.key_file else {
        return Ok(Arc::new(MemoryCredential::new(api_key)));
    };

    let file = FileCredential::new(path);
    if params.remember {
        if api_key.trim().is_empty() {
            bail!("--remember needs a non-empty --api-key; delete the key file to forget a key");
        }
        file.set_credential(&api_key)
            .with_context(|| format!("failed to save API key to '{}'", path.display()))?;
    }
    if api_key.trim().is_empty() {
        Ok(Arc::new(file))
    } else {
        Ok(Arc::new(MemoryCredential::new(api_key)))
    }
}

fn read_transcript(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read transcript '{}'", path.display())),
        None if io::stdin().is_terminal() => Ok(String::new()),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read transcript from stdin")?;
            Ok(buf)
        }
    }
}

/// Map "1".."4" onto the suggested topics; anything else is a free-form topic.
fn resolve_topic(state: &PipelineState, raw: &str) -> String {
    let raw = raw.trim();
    let picked = raw
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| state.suggested_topics().and_then(|t| t.get(i)));
    picked.map_or_else(|| raw.to_string(), Clone::clone)
}

fn print_analysis(state: &PipelineState) -> Result<()> {
    let (Some(analysis), Some(topics)) = (state.analysis(), state.suggested_topics()) else {
        return Ok(());
    };
    let mut err = io::stderr().lock();
    writeln!(err, "Hook: {}", analysis.hook_strategy)?;
    writeln!(err, "Pacing: {}", analysis.pacing_structure)?;
    writeln!(err, "Tone: {}", analysis.tone_and_style)?;
    writeln!(err, "Retention:")?;
    for item in &analysis.retention_techniques {
        writeln!(err, "  - {item}")?;
    }
    writeln!(err, "Viral factors:")?;
    for item in &analysis.viral_factors {
        writeln!(err, "  - {item}")?;
    }
    writeln!(err, "Suggested topics:")?;
    for (i, topic) in topics.iter().enumerate() {
        writeln!(err, "  {}. {topic}", i + 1)?;
    }
    Ok(())
}

fn prompt(lines: &mut impl Iterator<Item = io::Result<String>>, label: &str) -> Result<String> {
    eprint!("{label}");
    io::stderr().flush()?;
    match lines.next() {
        Some(line) => Ok(line?.trim().to_string()),
        None => bail!("stdin closed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(args: &[&str]) -> Params {
        let mut argv = vec!["scriptclone"];
        argv.extend_from_slice(args);
        Params::try_parse_from(argv).unwrap()
    }

    #[test]
    fn remember_with_blank_key_keeps_saved_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("key");
        std::fs::write(&path, "saved")?;
        let key_file = path.to_string_lossy().into_owned();

        let p = params(&["--remember", "--key-file", &key_file, "--api-key", "  "]);
        assert!(get_credentials(&p).is_err());
        assert_eq!(std::fs::read_to_string(&path)?, "saved");
        Ok(())
    }

    #[test]
    fn remember_saves_the_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("key");
        let key_file = path.to_string_lossy().into_owned();

        let p = params(&["--remember", "--key-file", &key_file, "--api-key", "abc"]);
        assert_eq!(get_credentials(&p)?.credential()?, "abc");
        assert_eq!(FileCredential::new(&path).credential()?, "abc");
        Ok(())
    }
}
