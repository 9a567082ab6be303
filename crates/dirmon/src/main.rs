//! dirmon - console for the monitored-directory API.
//!
//! Runs one command against the API. Writes go through the optimistic
//! mutation coordinator; failures are reported to the error-log endpoint
//! when error logging is enabled.

mod render;

use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use dirmon_core::config::DEFAULT_API_URL;
use dirmon_core::telemetry::{SourcePolicy, default_environment, panic_message};
use dirmon_core::{
    DirectoryCreate, DirectoryUpdate, Error, ErrorSource, HttpClient, MutationCoordinator,
    ResourceCache, Settings, TelemetryBuffer,
};

use render::RenderError;

/// Console for the monitored-directory API.
#[derive(Parser)]
#[command(name = "dirmon", about = "Manage monitored directories", version = dirmon_core::VERSION)]
struct Args {
    /// Base address of the directory API.
    #[arg(long, env = "DIRMON_API_URL", default_value = DEFAULT_API_URL, global = true)]
    api_url: String,

    /// Send client errors to the API's error-log endpoint.
    /// Off unless set to `true`.
    #[arg(
        long,
        env = "DIRMON_ENABLE_ERROR_LOGGING",
        default_value = "false",
        value_parser = explicit_true,
        action = ArgAction::Set,
        global = true
    )]
    error_logging: bool,

    /// Report rendering failures. On unless set to `false`.
    #[arg(long, env = "DIRMON_LOG_RENDERING", default_value = "true", value_parser = unless_false, action = ArgAction::Set, global = true)]
    log_rendering: bool,

    /// Report data-layer failures (validation, missing records).
    #[arg(long, env = "DIRMON_LOG_DATA_LAYER", default_value = "true", value_parser = unless_false, action = ArgAction::Set, global = true)]
    log_data_layer: bool,

    /// Report transport and server failures.
    #[arg(long, env = "DIRMON_LOG_TRANSPORT", default_value = "true", value_parser = unless_false, action = ArgAction::Set, global = true)]
    log_transport: bool,

    /// Report panics.
    #[arg(long, env = "DIRMON_LOG_GLOBAL", default_value = "true", value_parser = unless_false, action = ArgAction::Set, global = true)]
    log_global: bool,

    /// Report panics in background tasks.
    #[arg(long, env = "DIRMON_LOG_UNHANDLED_REJECTION", default_value = "true", value_parser = unless_false, action = ArgAction::Set, global = true)]
    log_unhandled_rejection: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is warn level.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List monitored directories.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one directory as stored on the server.
    Show {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Start monitoring a directory.
    Add {
        /// Absolute path of the directory.
        path: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Register the directory without enabling it.
        #[arg(long)]
        disabled: bool,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Change fields of a directory. Unset flags keep their value.
    Edit {
        id: i64,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, action = ArgAction::Set)]
        enabled: Option<bool>,
        #[arg(long)]
        updated_by: Option<String>,
    },
    /// Enable a disabled directory or disable an enabled one.
    Toggle { id: i64 },
    /// Stop monitoring a directory.
    Remove { id: i64 },
    /// Print the effective error-logging policy.
    Policy {
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::List { .. } => "list",
            Command::Show { .. } => "show",
            Command::Add { .. } => "add",
            Command::Edit { .. } => "edit",
            Command::Toggle { .. } => "toggle",
            Command::Remove { .. } => "remove",
            Command::Policy { .. } => "policy",
        }
    }
}

/// Master switch: only the literal `true` turns it on.
fn explicit_true(s: &str) -> Result<bool, String> {
    Ok(s.trim().eq_ignore_ascii_case("true"))
}

/// Per-source switch: only the literal `false` turns it off.
fn unless_false(s: &str) -> Result<bool, String> {
    Ok(!s.trim().eq_ignore_ascii_case("false"))
}

impl Args {
    fn settings(&self) -> Settings {
        let mut sources = SourcePolicy::default();
        sources.set(ErrorSource::Rendering, self.log_rendering);
        sources.set(ErrorSource::DataLayer, self.log_data_layer);
        sources.set(ErrorSource::Transport, self.log_transport);
        sources.set(ErrorSource::UncaughtGlobal, self.log_global);
        sources.set(ErrorSource::UnhandledRejection, self.log_unhandled_rejection);
        Settings {
            api_url: self.api_url.clone(),
            telemetry_enabled: self.error_logging,
            sources,
            environment: default_environment(),
        }
    }
}

/// Initializes the tracing subscriber. `RUST_LOG` directives are kept;
/// -v/-q set the level for dirmon's own crates.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["dirmon", "dirmon_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Why a command failed.
enum Failure {
    Api(Error),
    Render(RenderError),
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Failure::Api(e)
    }
}

impl From<RenderError> for Failure {
    fn from(e: RenderError) -> Self {
        Failure::Render(e)
    }
}

type Coordinator = MutationCoordinator<HttpClient>;

async fn run(
    coordinator: &Coordinator,
    telemetry: &TelemetryBuffer<HttpClient>,
    command: Command,
) -> Result<(), Failure> {
    match command {
        Command::List { json } => {
            let records = coordinator.list().await?;
            let text = if json {
                render::json(records.records())?
            } else {
                render::table(&records)
            };
            render::emit(&text)?;
        }
        Command::Show { id, json } => {
            let record = coordinator.get(id).await?;
            let text = if json {
                render::json(&record)?
            } else {
                render::detail(&record)
            };
            render::emit(&text)?;
        }
        Command::Add {
            path,
            name,
            description,
            disabled,
            created_by,
        } => {
            let input = DirectoryCreate {
                enabled: Some(!disabled),
                display_name: name,
                description,
                created_by,
                ..DirectoryCreate::new(path)
            };
            let created = coordinator.create(input).await?;
            info!(id = created.id, path = %created.directory_path, "directory added");
            render::emit(&render::detail(&created))?;
        }
        Command::Edit {
            id,
            path,
            name,
            description,
            enabled,
            updated_by,
        } => {
            let patch = DirectoryUpdate {
                directory_path: path,
                enabled,
                display_name: name,
                description,
                updated_by,
                ..Default::default()
            };
            if patch.is_empty() {
                return Err(Error::Validation("nothing to change".to_string()).into());
            }
            let updated = coordinator.update(id, patch).await?;
            render::emit(&render::detail(&updated))?;
        }
        Command::Toggle { id } => {
            let toggled = coordinator.toggle(id).await?;
            let state = if toggled.enabled { "enabled" } else { "disabled" };
            render::emit(&format!("{} is now {}", toggled.label(), state))?;
        }
        Command::Remove { id } => {
            coordinator.delete(id).await?;
            render::emit(&format!("directory {} removed", id))?;
        }
        Command::Policy { json } => {
            let policy = telemetry.config();
            let text = if json {
                render::json(&policy)?
            } else {
                render::policy(&policy)
            };
            render::emit(&text)?;
        }
    }
    Ok(())
}

/// Records panics as uncaught errors, then defers to the previous hook.
fn install_panic_hook(telemetry: Arc<TelemetryBuffer<HttpClient>>) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let mut message = panic_message(info.payload());
        if let Some(location) = info.location() {
            message = format!("{} at {}:{}", message, location.file(), location.line());
        }
        telemetry.record_detached(message, ErrorSource::UncaughtGlobal, None);
        previous(info);
    }));
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    let settings = args.settings();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    let client = match HttpClient::new(&settings.api_url) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // The telemetry flush timer is spawned on construction.
    let _guard = runtime.enter();
    let telemetry = TelemetryBuffer::from_settings(Arc::clone(&client), &settings);
    telemetry.set_location(std::env::args().collect::<Vec<_>>().join(" "));
    install_panic_hook(Arc::clone(&telemetry));

    let coordinator = MutationCoordinator::new(client, Arc::new(ResourceCache::new()))
        .with_telemetry(Arc::clone(&telemetry));

    let command_name = args.command.name();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(run(&coordinator, &telemetry, args.command))
    }));

    let code = match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(Failure::Api(e))) => {
            // Coordinator failures are reported where they occur.
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
        Ok(Err(Failure::Render(e))) => {
            let mut context = serde_json::Map::new();
            context.insert("command".to_string(), command_name.into());
            runtime.block_on(telemetry.record(
                dirmon_core::ReportedError::from_error(&e),
                ErrorSource::Rendering,
                Some(context),
            ));
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
        Err(_) => ExitCode::from(101),
    };

    runtime.block_on(telemetry.shutdown());
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_parsers() {
        assert_eq!(explicit_true("true"), Ok(true));
        assert_eq!(explicit_true("TRUE"), Ok(true));
        assert_eq!(explicit_true("1"), Ok(false));
        assert_eq!(explicit_true(""), Ok(false));

        assert_eq!(unless_false("false"), Ok(false));
        assert_eq!(unless_false("no"), Ok(true));
        assert_eq!(unless_false(""), Ok(true));
    }

    #[test]
    fn test_settings_from_flags() {
        let args = Args::try_parse_from([
            "dirmon",
            "--api-url",
            "http://api.internal:9000",
            "--error-logging",
            "true",
            "--log-transport",
            "false",
            "list",
        ])
        .unwrap();
        let settings = args.settings();
        assert_eq!(settings.api_url, "http://api.internal:9000");
        assert!(settings.telemetry_enabled);

        let policy = settings.logging_policy();
        assert!(!policy.is_enabled(ErrorSource::Transport));
        assert!(policy.is_enabled(ErrorSource::DataLayer));
    }

    #[test]
    fn test_edit_parses_optional_fields() {
        let args =
            Args::try_parse_from(["dirmon", "edit", "4", "--enabled", "false", "--name", "Logs"])
                .unwrap();
        match args.command {
            Command::Edit {
                id, enabled, name, path, ..
            } => {
                assert_eq!(id, 4);
                assert_eq!(enabled, Some(false));
                assert_eq!(name.as_deref(), Some("Logs"));
                assert_eq!(path, None);
            }
            _ => panic!("expected edit"),
        }
    }
}
