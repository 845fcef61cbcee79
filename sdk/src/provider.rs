//! Helpers for provider binaries
//!
//! A provider only needs three things from the host: the verb it was
//! invoked with, the configuration on standard input, and a way to write its
//! result and log records in the expected shape.
//!
//! ```no_run
//! use sdk::protocol::{LogLevel, ProviderOutput, Verb};
//! use sdk::provider;
//!
//! # fn main() -> Result<(), sdk::EngineError> {
//! match provider::verb_from_args(std::env::args())? {
//!     Verb::Probe => {
//!         provider::log(LogLevel::Info, "raid", "probing controller");
//!         provider::emit_output(&ProviderOutput::success(Default::default()))?;
//!     }
//!     Verb::Plan | Verb::Apply => {
//!         let _config = provider::read_config(std::io::stdin())?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::errors::EngineError;
use crate::protocol::{DesiredConfig, LogEntry, LogLevel, ProviderOutput, Verb};
use std::io::{self, Read, Write};

/// Determine the verb from process arguments (`argv[1]`)
pub fn verb_from_args<I>(args: I) -> Result<Verb, EngineError>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .nth(1)
        .ok_or_else(|| EngineError::UnknownVerb(String::new()))?
        .parse()
}

/// Read the configuration object from a reader (normally standard input)
///
/// An empty input yields an empty configuration.
pub fn read_config<R: Read>(mut reader: R) -> Result<DesiredConfig, EngineError> {
    let mut input = String::new();
    reader.read_to_string(&mut input)?;

    if input.trim().is_empty() {
        return Ok(DesiredConfig::default());
    }

    DesiredConfig::from_json(&input)
}

/// Write the result object to standard output
pub fn emit_output(output: &ProviderOutput) -> Result<(), EngineError> {
    let mut stdout = io::stdout().lock();
    write_output(&mut stdout, output)
}

/// Write the result object to any writer
pub fn write_output<W: Write>(writer: &mut W, output: &ProviderOutput) -> Result<(), EngineError> {
    let line = serde_json::to_string(output)
        .map_err(|e| EngineError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    writeln!(writer, "{}", line)?;
    writer.flush()?;
    Ok(())
}

/// Write one structured log record to standard error
///
/// Logging never fails the provider; write errors are ignored.
pub fn log(level: LogLevel, component: &str, msg: &str) {
    let entry = LogEntry::new(level, component, msg);
    if let Ok(line) = serde_json::to_string(&entry) {
        let _ = writeln!(io::stderr().lock(), "{}", line);
    }
}
