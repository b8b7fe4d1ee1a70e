use std::io::Write;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::output_type::OutputType;
use crate::script::{Script, Section};

pub trait ScriptEncoder {
    fn write_script(&mut self, script: &Script) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Pick the encoder for `output_type`.
pub fn encoder_for<'a, W: Write + 'a>(
    output_type: OutputType,
    w: W,
) -> Box<dyn ScriptEncoder + 'a> {
    match output_type {
        OutputType::Json => Box::new(JsonScriptEncoder::new(w)),
        OutputType::Text => Box::new(TextScriptEncoder::new(w)),
    }
}

/// Writes each script as a pretty-printed `{"newScript": ...}` document.
pub struct JsonScriptEncoder<W: Write> {
    w: W,
    closed: bool,
}

impl<W: Write> JsonScriptEncoder<W> {
    pub fn new(w: W) -> Self {
        Self { w, closed: false }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Wrapped<'a> {
    new_script: &'a Script,
}

impl<W: Write> ScriptEncoder for JsonScriptEncoder<W> {
    fn write_script(&mut self, script: &Script) -> Result<()> {
        if self.closed {
            bail!("cannot write script: encoder is already closed");
        }
        serde_json::to_writer_pretty(&mut self.w, &Wrapped { new_script: script })?;
        writeln!(&mut self.w)?;
        self.w.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.w.flush()?;
        self.closed = true;
        Ok(())
    }
}

/// Writes a script in copy-paste layout:
///
/// ```text
/// <title>
/// Target audience: <audience>
///
/// [Hook | 0:00 - 0:10]
/// (Visual: ...)
/// Narration: ...
///
/// ```
pub struct TextScriptEncoder<W: Write> {
    w: W,
    closed: bool,
}

impl<W: Write> TextScriptEncoder<W> {
    pub fn new(w: W) -> Self {
        Self { w, closed: false }
    }

    fn write_section(&mut self, section: &Section) -> Result<()> {
        writeln!(
            &mut self.w,
            "[{} | {}]",
            section.section_name, section.estimated_duration
        )?;
        writeln!(&mut self.w, "(Visual: {})", section.visual_cue)?;
        writeln!(&mut self.w, "Narration: {}", section.audio_script)?;
        writeln!(&mut self.w)?;
        Ok(())
    }
}

impl<W: Write> ScriptEncoder for TextScriptEncoder<W> {
    fn write_script(&mut self, script: &Script) -> Result<()> {
        if self.closed {
            bail!("cannot write script: encoder is already closed");
        }
        writeln!(&mut self.w, "{}", script.title)?;
        writeln!(&mut self.w, "Target audience: {}", script.target_audience)?;
        writeln!(&mut self.w)?;
        // Playback order; never reorder.
        for section in &script.sections {
            self.write_section(section)?;
        }
        self.w.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.w.flush()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Script {
        let section = |name: &str, dur: &str| Section {
            section_name: name.to_string(),
            visual_cue: format!("{name} shot"),
            audio_script: format!("{name} line"),
            estimated_duration: dur.to_string(),
        };
        Script {
            title: "Why Mars?".to_string(),
            target_audience: "Space fans".to_string(),
            sections: vec![section("Hook", "0:00 - 0:10"), section("Outro", "0:10 - 0:20")],
        }
    }

    #[test]
    fn text_layout_keeps_section_order() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = TextScriptEncoder::new(&mut out);
        enc.write_script(&script())?;
        enc.close()?;

        let s = std::str::from_utf8(&out)?;
        assert!(s.starts_with("Why Mars?\nTarget audience: Space fans\n\n"));
        assert!(s.contains("[Hook | 0:00 - 0:10]\n(Visual: Hook shot)\nNarration: Hook line\n\n"));
        let hook = s.find("[Hook").unwrap_or(usize::MAX);
        let outro = s.find("[Outro").unwrap_or(0);
        assert!(hook < outro);
        Ok(())
    }

    #[test]
    fn json_uses_wire_field_names() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = JsonScriptEncoder::new(&mut out);
        enc.write_script(&script())?;
        enc.close()?;

        let value: serde_json::Value = serde_json::from_slice(&out)?;
        assert_eq!(value["newScript"]["targetAudience"], "Space fans");
        assert_eq!(value["newScript"]["sections"][1]["sectionName"], "Outro");
        Ok(())
    }

    #[test]
    fn write_after_close_errors() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = encoder_for(OutputType::Text, &mut out);
        enc.close()?;
        let err = enc.write_script(&script()).unwrap_err();
        assert!(err.to_string().contains("already closed"));
        Ok(())
    }
}
