// Mock hardware provider
//
// Implements the probe/plan/apply protocol against a JSON state file so the
// engine can be exercised without a RAID controller.
//
// Environment:
//   PROVIDER_MOCK_STATE       state file (default ./provider-mock-state.json)
//   PROVIDER_MOCK_DELAY_MS    sleep before answering
//   PROVIDER_MOCK_PID_FILE    write the process id here on start
//   PROVIDER_MOCK_RAW_STDERR  emit a non-JSON line on stderr
//   PROVIDER_MOCK_GARBAGE     answer with non-JSON stdout
//   PROVIDER_MOCK_EXIT        exit with this code after answering
//   PROVIDER_MOCK_ESCAPE      ignore the verb and try to break out instead:
//                             read PROVIDER_MOCK_ESCAPE_PATH, fork
//                             PROVIDER_MOCK_ESCAPE_FORKS children and connect
//                             to PROVIDER_MOCK_ESCAPE_ADDR, then report what
//                             worked

use sdk::errors::EngineError;
use sdk::protocol::{DesiredConfig, LogLevel, ProviderOutput, Verb, VIRTUAL_DRIVES_KEY};
use sdk::provider;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use std::{env, fs, io, thread};

const COMPONENT: &str = "mock-raid";

#[derive(Debug, Default, Serialize, Deserialize)]
struct MockState {
    #[serde(default)]
    virtual_drives: Vec<Value>,
}

impl MockState {
    fn path() -> PathBuf {
        env::var_os("PROVIDER_MOCK_STATE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("provider-mock-state.json"))
    }

    fn load() -> Result<Self, EngineError> {
        match fs::read(Self::path()) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::Io(io::Error::new(io::ErrorKind::InvalidData, e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(Self::path(), bytes)?;
        Ok(())
    }
}

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn probe() -> Result<ProviderOutput, EngineError> {
    provider::log(LogLevel::Info, COMPONENT, "probing controller");
    let state = MockState::load()?;
    provider::log(
        LogLevel::Debug,
        COMPONENT,
        &format!("found {} virtual drives", state.virtual_drives.len()),
    );
    Ok(ProviderOutput::success(data(json!({
        (VIRTUAL_DRIVES_KEY): state.virtual_drives,
    }))))
}

fn missing_desired_state() -> ProviderOutput {
    provider::log(LogLevel::Error, COMPONENT, "desired_state is required");
    ProviderOutput::failed(data(json!({ "error": "desired_state is required" })))
}

fn plan(config: &DesiredConfig) -> Result<ProviderOutput, EngineError> {
    let Some(desired) = &config.desired_state else {
        return Ok(missing_desired_state());
    };
    provider::log(LogLevel::Info, COMPONENT, "planning virtual drive");
    Ok(ProviderOutput::success(data(json!({
        "actions": [{
            "op": "create_virtual_drive",
            "level": desired.level,
            "drives": desired.drive_ids(),
        }],
    }))))
}

fn apply(config: &DesiredConfig) -> Result<ProviderOutput, EngineError> {
    let Some(desired) = &config.desired_state else {
        return Ok(missing_desired_state());
    };

    let mut state = MockState::load()?;
    let id = format!("vd_{}", state.virtual_drives.len());
    state.virtual_drives.push(json!({
        "id": id,
        "level": desired.level,
        "drives": desired.drive_ids(),
    }));
    state.save()?;

    provider::log(
        LogLevel::Info,
        COMPONENT,
        &format!("created {} (level {})", id, desired.level.as_deref().unwrap_or("?")),
    );
    Ok(ProviderOutput::success(data(json!({ "created": id }))))
}

/// Children successfully forked out of `attempts`; all are killed and reaped
#[cfg(unix)]
fn fork_children(attempts: usize) -> usize {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, ForkResult};

    let mut children = Vec::new();
    for _ in 0..attempts {
        // SAFETY: the mock is single-threaded and the child only sleeps and exits
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                thread::sleep(Duration::from_secs(30));
                // SAFETY: exits the forked child without running parent cleanup
                unsafe { nix::libc::_exit(0) }
            }
            Ok(ForkResult::Parent { child }) => children.push(child),
            Err(e) => {
                provider::log(LogLevel::Warn, COMPONENT, &format!("fork refused: {}", e));
                break;
            }
        }
    }
    for child in &children {
        let _ = kill(*child, Signal::SIGKILL);
        let _ = waitpid(*child, None);
    }
    children.len()
}

#[cfg(not(unix))]
fn fork_children(_attempts: usize) -> usize {
    0
}

fn escape() -> ProviderOutput {
    let read_host_file = env::var_os("PROVIDER_MOCK_ESCAPE_PATH")
        .map(|path| fs::read(path).is_ok())
        .unwrap_or(false);

    let attempts = env::var("PROVIDER_MOCK_ESCAPE_FORKS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(16);
    let forked = fork_children(attempts);

    let connected = env::var("PROVIDER_MOCK_ESCAPE_ADDR")
        .ok()
        .and_then(|v| v.parse::<SocketAddr>().ok())
        .map(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok())
        .unwrap_or(false);

    provider::log(
        LogLevel::Warn,
        COMPONENT,
        &format!(
            "escape attempts: read={} forked={}/{} connected={}",
            read_host_file, forked, attempts, connected
        ),
    );
    ProviderOutput::success(data(json!({
        "read_host_file": read_host_file,
        "forked": forked,
        "fork_attempts": attempts,
        "connected": connected,
    })))
}

fn run() -> Result<ProviderOutput, EngineError> {
    let verb = provider::verb_from_args(env::args())?;
    match verb {
        Verb::Probe => probe(),
        Verb::Plan => plan(&provider::read_config(io::stdin())?),
        Verb::Apply => apply(&provider::read_config(io::stdin())?),
    }
}

fn main() -> ExitCode {
    if let Some(pid_file) = env::var_os("PROVIDER_MOCK_PID_FILE") {
        let _ = fs::write(pid_file, std::process::id().to_string());
    }
    if env::var_os("PROVIDER_MOCK_RAW_STDERR").is_some() {
        eprintln!("mock provider starting");
    }
    if let Some(ms) = env::var("PROVIDER_MOCK_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        thread::sleep(Duration::from_millis(ms));
    }

    if env::var_os("PROVIDER_MOCK_GARBAGE").is_some() {
        println!("this is not json");
        return ExitCode::SUCCESS;
    }

    let result = if env::var_os("PROVIDER_MOCK_ESCAPE").is_some() {
        Ok(escape())
    } else {
        run()
    };

    let (output, mut code) = match result {
        Ok(output) => (output, 0),
        Err(e) => {
            provider::log(LogLevel::Error, COMPONENT, &e.to_string());
            (
                ProviderOutput::failed(data(json!({ "error": e.to_string() }))),
                1,
            )
        }
    };

    if provider::emit_output(&output).is_err() {
        return ExitCode::from(1);
    }

    if let Some(forced) = env::var("PROVIDER_MOCK_EXIT")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
    {
        code = forced;
    }
    ExitCode::from(code)
}
