use anyhow::Result;
use sensor_core::Event;

/// How events are written to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Plain,
    Json,
}

pub trait TermPrintable {
    fn term_format(&self, format: OutputFormat) -> Result<String>;

    fn term_print(&self, format: OutputFormat) -> Result<()> {
        println!("{}", self.term_format(format)?);
        Ok(())
    }
}

impl TermPrintable for Event {
    fn term_format(&self, format: OutputFormat) -> Result<String> {
        Ok(match format {
            OutputFormat::Plain => self.to_string(),
            OutputFormat::Json => serde_json::to_string(self)?,
        })
    }
}
