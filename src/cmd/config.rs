//! Configuration view and validation commands — `cadforge config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use cadforge::cad_config::{CONFIG_FILE_NAME, CadToml};
    use cadforge::config::DATA_DIR_NAME;

    let data_dir = project_dir.join(DATA_DIR_NAME);
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("cadforge Configuration");
            println!("======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                CadToml::load(&config_path)?
            } else {
                println!("No cadforge.toml found at {}", config_path.display());
                println!("Using default configuration.");
                CadToml::default()
            };
            println!();
            print_sections(&toml);

            // Effective values after environment overrides
            let mut effective = toml.clone();
            effective.apply_env();
            println!("Effective values (with env overrides):");
            println!("  generator.command = \"{}\"", effective.generator.command);
            println!("  executor.interpreter = \"{}\"", effective.executor.interpreter);
            println!("  executor.timeout_secs = {}", effective.executor.timeout_secs);
            println!();

            if !config_path.exists() {
                println!("Run 'cadforge config init' to create a cadforge.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No cadforge.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = CadToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("cadforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !data_dir.exists() {
                std::fs::create_dir_all(&data_dir)?;
            }

            CadToml::default().save(&config_path)?;

            println!("Created cadforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [generator] kind, command, endpoint, model, timeout_secs");
            println!("  - [executor] runtime, interpreter, timeout_secs, formats");
            println!("  - [parts] max_parallel, accept_partial_export");
            println!("  - [feedback] enabled");
            println!();
        }
    }

    Ok(())
}

fn print_sections(toml: &cadforge::cad_config::CadToml) {
    let formats: Vec<&str> = toml.executor.formats.iter().map(|f| f.as_str()).collect();

    println!("[generator]");
    println!("  kind = \"{}\"", toml.generator.kind);
    println!("  command = \"{}\"", toml.generator.command);
    if !toml.generator.args.is_empty() {
        println!("  args = {:?}", toml.generator.args);
    }
    println!("  endpoint = \"{}\"", toml.generator.endpoint);
    println!("  model = \"{}\"", toml.generator.model);
    println!("  api_key_env = \"{}\"", toml.generator.api_key_env);
    println!("  timeout_secs = {}", toml.generator.timeout_secs);
    println!();
    println!("[executor]");
    println!("  runtime = \"{}\"", toml.executor.runtime);
    println!("  interpreter = \"{}\"", toml.executor.interpreter);
    println!("  timeout_secs = {}", toml.executor.timeout_secs);
    println!("  result_binding = \"{}\"", toml.executor.result_binding);
    println!("  formats = {:?}", formats);
    println!();
    println!("[parts]");
    println!("  max_parallel = {}", toml.parts.max_parallel);
    println!(
        "  accept_partial_export = {}",
        toml.parts.accept_partial_export
    );
    println!();
    println!("[feedback]");
    println!("  enabled = {}", toml.feedback.enabled);
    println!();
}
