use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::TriageError;
use crate::output;
use crate::pipeline::Pipeline;
use crate::triage::{Outcome, OutcomeStatus, TriggerEvent};

#[derive(Parser)]
#[command(name = "citriage")]
#[command(author, version, about = "CI failure triage", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (toml, json or yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

/// Identifies the failing run; flags override fields of the event payload.
#[derive(Args)]
struct InvocationArgs {
    /// Invocation payload as JSON, `-` for stdin
    #[arg(short, long)]
    event: Option<PathBuf>,

    /// Repository in `owner/name` form
    #[arg(short, long)]
    repo: Option<String>,

    /// Run or job link of the failed pipeline
    #[arg(short, long)]
    logs_url: Option<String>,

    #[arg(short, long)]
    branch: Option<String>,

    #[arg(short, long, env = "GITHUB_PAT", hide_env_values = true)]
    token: Option<String>,

    /// GitHub API base URL
    #[arg(long)]
    github_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose a failed run and publish the result
    Triage {
        #[command(flatten)]
        invocation: InvocationArgs,

        #[arg(long, env = "MODEL_API_KEY", hide_env_values = true)]
        model_api_key: Option<String>,

        /// Model identifier
        #[arg(short, long)]
        model: Option<String>,

        /// Render the comment without writing it
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Keep the diagnosis local
        #[arg(long, default_value_t = false)]
        no_publish: bool,

        /// Send matching repository files to the model with the log
        #[arg(long, default_value_t = false)]
        repo_context: bool,
    },
    /// Show which job would be diagnosed
    Locate {
        #[command(flatten)]
        invocation: InvocationArgs,
    },
    /// Print the effective configuration, or write a default file
    Config {
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn read_event(path: &Path) -> Result<TriggerEvent> {
    let contents = if path == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read event from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file: {}", path.display()))?
    };

    serde_json::from_str(&contents)
        .context("Event must be a JSON object with repo_name, logs_url and branch_name")
}

impl InvocationArgs {
    fn event(&self) -> Result<TriggerEvent> {
        let mut event = match &self.event {
            Some(path) => read_event(path)?,
            None => TriggerEvent::default(),
        };
        if let Some(repo) = &self.repo {
            event.repo_name.clone_from(repo);
        }
        if let Some(logs_url) = &self.logs_url {
            event.logs_url.clone_from(logs_url);
        }
        if let Some(branch) = &self.branch {
            event.branch_name.clone_from(branch);
        }
        Ok(event)
    }

    fn apply(&self, config: &mut Config) {
        if let Some(token) = &self.token {
            config.github.token = Some(token.clone());
        }
        if let Some(url) = &self.github_url {
            config.github.base_url.clone_from(url);
        }
    }
}

impl Cli {
    fn write_json(&self, value: &impl Serialize) -> Result<()> {
        let json_output = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };

        if let Some(output_path) = &self.output {
            std::fs::write(output_path, json_output)?;
            info!("Outcome written to: {}", output_path.display());
        } else {
            println!("{}", json_output);
        }

        Ok(())
    }

    fn load_config(&self, invocation: &InvocationArgs) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        invocation.apply(&mut config);
        Ok(config)
    }

    /// Emits a failure outcome for problems found before the pipeline runs.
    fn reject(&self, error: &anyhow::Error) -> Result<i32> {
        let error = TriageError::Config(format!("{error:#}"));
        let outcome = Outcome::failure(&error);
        output::print_summary(&outcome);
        self.write_json(&outcome)?;
        Ok(outcome.status.exit_code())
    }

    async fn execute_triage(
        &self,
        invocation: &InvocationArgs,
        model_api_key: Option<&str>,
        model: Option<&str>,
        dry_run: bool,
        no_publish: bool,
        repo_context: bool,
    ) -> Result<i32> {
        let prepared = self.load_config(invocation).and_then(|config| {
            let event = invocation.event()?;
            Ok((config, event))
        });
        let (mut config, event) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.reject(&e),
        };

        if let Some(key) = model_api_key {
            config.model.api_key = Some(key.to_string());
        }
        if let Some(model) = model {
            config.model.id = model.to_string();
        }
        config.publish.dry_run |= dry_run;
        if no_publish {
            config.publish.enabled = false;
        }
        config.context.enabled |= repo_context;

        let outcome = match Pipeline::new(config) {
            Ok(pipeline) => {
                let show_progress = console::Term::stderr().is_term();
                pipeline.with_progress(show_progress).run(&event).await
            }
            Err(e) => Outcome::failure(&e),
        };

        output::print_summary(&outcome);
        self.write_json(&outcome)?;
        Ok(outcome.status.exit_code())
    }

    async fn execute_locate(&self, invocation: &InvocationArgs) -> Result<i32> {
        let prepared = self.load_config(invocation).and_then(|config| {
            let event = invocation.event()?;
            Ok((config, event))
        });
        let (config, event) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.reject(&e),
        };

        let located = match Pipeline::new(config) {
            Ok(pipeline) => pipeline.locate_only(&event).await,
            Err(e) => Err(e),
        };

        match located {
            Ok(job) => {
                output::print_located_job(&job);
                self.write_json(&job)?;
                Ok(0)
            }
            Err(e) => {
                let outcome = Outcome::failure(&e);
                output::print_summary(&outcome);
                self.write_json(&outcome)?;
                Ok(OutcomeStatus::Failure.exit_code())
            }
        }
    }

    fn execute_config(&self, write: Option<&Path>) -> Result<i32> {
        if let Some(path) = write {
            Config::default().save(path)?;
            info!("Default configuration written to: {}", path.display());
            return Ok(0);
        }

        let config = Config::load(self.config.as_deref())?;
        print!("{}", toml::to_string_pretty(&config.redacted())?);
        Ok(0)
    }

    /// Runs the selected command and returns the process exit code.
    pub async fn execute(&self) -> Result<i32> {
        match &self.command {
            Commands::Triage {
                invocation,
                model_api_key,
                model,
                dry_run,
                no_publish,
                repo_context,
            } => {
                self.execute_triage(
                    invocation,
                    model_api_key.as_deref(),
                    model.as_deref(),
                    *dry_run,
                    *no_publish,
                    *repo_context,
                )
                .await
            }
            Commands::Locate { invocation } => self.execute_locate(invocation).await,
            Commands::Config { write } => self.execute_config(write.as_deref()),
        }
    }
}
