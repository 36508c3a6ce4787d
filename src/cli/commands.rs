use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::io::Write;

use crate::{
    app::{get_config_dir, init_config, AppState, Config},
    engine::OpenAiCompatEngine,
    privacy::NetworkMode,
    runtime::ModelSize,
};

use super::{Commands, OutputFormat};

/// Result of a one-shot `ask`
#[derive(Debug, Serialize)]
pub struct AskResult {
    pub prompt: String,
    pub model: ModelSize,
    pub mode: NetworkMode,
    pub response: String,
    pub cancelled: bool,
    pub tokens_per_second: f64,
}

/// Handle CLI subcommands
pub async fn handle_command(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Ask {
            prompt,
            model,
            mode,
            max_tokens,
            temperature,
            output_format,
        } => {
            let options = AskOptions {
                model,
                mode,
                max_tokens,
                temperature,
            };
            let result = ask(config, &prompt, options, output_format).await?;
            print!("{}", format_result(&result, output_format));
            Ok(())
        }
        Commands::Models => list_models(&config).await,
        Commands::Status => show_status(&config).await,
        Commands::Init => {
            println!("Initializing Jarvis configuration...");
            for path in init_config()? {
                println!("  Created {}", path.display().to_string().green());
            }
            println!("Configuration initialized successfully!");
            Ok(())
        }
    }
}

struct AskOptions {
    model: Option<ModelSize>,
    mode: Option<NetworkMode>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
}

async fn ask(
    config: Config,
    prompt: &str,
    options: AskOptions,
    format: OutputFormat,
) -> Result<AskResult> {
    let app = AppState::new(config)?;

    if let Some(mode) = options.mode {
        app.set_mode(mode);
    }
    let loaded = match options.model {
        Some(size) => app.select_model(size).await,
        None => app.ensure_loaded().await,
    };
    loaded.context("Failed to load model")?;

    let mut request = app.prepare(prompt).await;
    if let Some(max_tokens) = options.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = options.temperature {
        request = request.with_temperature(temperature);
    }
    if format == OutputFormat::Text {
        request = request.on_token(|fragment| {
            print!("{}", fragment);
            let _ = std::io::stdout().flush();
        });
    }

    // Ctrl-C stops the generation but keeps what was produced
    let cancel = request.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let outcome = app.runtime().generate(request).await;
    interrupt.abort();

    let (response, cancelled) = match outcome {
        Ok(text) => (text, false),
        Err(e) if e.is_cancelled() => (e.partial_text().unwrap_or_default().to_string(), true),
        Err(e) => return Err(e).context("Generation failed"),
    };

    Ok(AskResult {
        prompt: prompt.to_string(),
        model: app.selected_model(),
        mode: app.mode(),
        response,
        cancelled,
        tokens_per_second: app.runtime().state().tokens_per_second,
    })
}

/// Render an `ask` result; in text mode the response was already streamed
pub fn format_result(result: &AskResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            let mut json = serde_json::to_string_pretty(result).unwrap_or_else(|e| {
                format!("{{\"error\": \"Failed to serialize result: {}\"}}", e)
            });
            json.push('\n');
            json
        }
        OutputFormat::Text => {
            let mut output = String::from("\n");
            if result.cancelled {
                output.push_str(&format!("{}\n", "[cancelled]".yellow()));
            }
            output.push_str(&format!(
                "{}\n",
                format!(
                    "{} | {} | {:.1} tok/s",
                    result.model.display_name(),
                    result.mode.display_name(),
                    result.tokens_per_second
                )
                .dimmed()
            ));
            output
        }
    }
}

/// List model variants and whether the engine serves them
pub async fn list_models(config: &Config) -> Result<()> {
    let served = match OpenAiCompatEngine::new(&config.engine.base_url, config.engine.api_key()) {
        Ok(engine) => engine.list_models().await.ok(),
        Err(_) => None,
    };

    println!("Available models:");
    for size in ModelSize::ALL {
        let descriptor = config.descriptor(size);
        let weights_name = descriptor
            .weights_path
            .rsplit('/')
            .next()
            .unwrap_or(descriptor.weights_path.as_str());
        let marker = match &served {
            Some(ids) if ids.iter().any(|id| id == weights_name) => "[served]".green(),
            Some(_) => "[missing]".red(),
            None => "[unknown]".yellow(),
        };
        let default = if size == config.runtime.default_model {
            " (default)"
        } else {
            ""
        };
        println!(
            "  • {}{} {} {}",
            size.display_name().green(),
            default,
            descriptor.weights_path,
            marker
        );
    }
    Ok(())
}

/// Show status of the engine, configuration and network policy
async fn show_status(config: &Config) -> Result<()> {
    println!("Jarvis Status:");
    println!();

    match OpenAiCompatEngine::new(&config.engine.base_url, config.engine.api_key()) {
        Ok(engine) => match engine.list_models().await {
            Ok(models) => println!(
                "  [OK] Engine: {} ({} models served)",
                engine.base_url(),
                models.len()
            ),
            Err(e) => println!("  [ERROR] Engine: {}", e),
        },
        Err(e) => println!("  [ERROR] Engine: {}", e),
    }

    let config_path = get_config_dir()?.join("config.toml");
    if config_path.exists() {
        println!("  [OK] Configuration: {}", config_path.display());
    } else {
        println!("  [WARNING] Configuration: Not found (using defaults)");
    }

    println!("  Runtime: models load on first ask");
    println!(
        "  Default model: {}",
        config.descriptor(config.runtime.default_model)
    );
    println!(
        "  Network mode: {} ({})",
        config.network.default_mode.display_name(),
        config.network.default_mode.description()
    );
    match &config.search.endpoint {
        Some(endpoint) => println!("  Search: {}", endpoint),
        None => println!("  Search: disabled"),
    }

    println!("\n  Allowed hosts:");
    for host in &config.network.allowed_hosts {
        println!("    • {}", host);
    }

    println!("\n  Environment:");
    if config.engine.api_key().is_some() {
        println!("    • {}: Set", config.engine.api_key_env);
    } else {
        println!("    • {}: Not set", config.engine.api_key_env);
    }

    println!();
    Ok(())
}
