// Provisio hardware provider engine
// Main entry point for the provisio binary

use clap::Parser;
use provisio_engine::cli::{Cli, Command};
use provisio_engine::config::Config;
use provisio_engine::handlers::{
    handle_exec, handle_extract, handle_import, handle_keygen, handle_list, handle_pack,
    handle_remove, handle_run, handle_schema_defaults, handle_show, handle_violations,
    OutputFormat, PackRequest,
};
use provisio_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = match &cli.config {
        Some(config_path) => Config::load_or_create_at(config_path)?,
        None => Config::load_or_create()?,
    };

    // --log wins over the config; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    tracing::debug!(
        "Provisio v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    match cli.command {
        Command::Import { package } => handle_import(&package, &config, format),

        Command::List => handle_list(&config, format),

        Command::Show { id } => handle_show(&id, &config, format),

        Command::Remove { id } => handle_remove(&id, &config, format),

        Command::Exec { id, verb, input } => {
            tracing::info!("Running {} {}", id, verb);
            handle_exec(&id, verb, input.as_deref(), &config, format).await
        }

        Command::Run { id, input, job_id } => {
            tracing::info!("Converging {} from {}", id, input.display());
            handle_run(&id, &input, job_id, &config, format).await
        }

        Command::Pack {
            manifest,
            watermark,
            binary,
            signing_key,
            schema,
            output,
        } => handle_pack(
            PackRequest {
                manifest: &manifest,
                watermark: &watermark,
                binary: &binary,
                signing_key: &signing_key,
                schema: schema.as_deref(),
                output: &output,
            },
            &config,
            format,
        ),

        Command::Extract { package, dest } => handle_extract(&package, &dest, format),

        Command::Keygen { dir, force } => handle_keygen(&dir, force, format),

        Command::Violations { active } => handle_violations(active, &config, format),

        Command::SchemaDefaults { package } => handle_schema_defaults(&package),
    }
}
