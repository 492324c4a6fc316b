//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// The control plane answered with a `fail` envelope.
    #[error("{message} ({code})")]
    Api {
        status: u16,
        code: String,
        message: String,
        retryable: bool,
        request_id: Option<String>,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    let Some(cli_err) = err.downcast_ref::<CliError>() else {
        return;
    };
    match cli_err {
        CliError::Api { code, .. } if code == "already_in_progress" => {
            eprintln!(
                "\n{}",
                "Hint: Wait for the running operation, or run `mserve unlock <id>` if it crashed."
                    .yellow()
            );
        }
        CliError::Api { code, .. } if code == "deletion_timeout" => {
            eprintln!(
                "\n{}",
                "Hint: Old resources are still terminating. Clean them up, then redeploy.".yellow()
            );
        }
        CliError::Api {
            retryable: true, ..
        } => {
            eprintln!("\n{}", "Hint: This error is transient; retry shortly.".yellow());
        }
        CliError::Network(_) => {
            eprintln!(
                "\n{}",
                "Hint: Check that the control plane is running and MSERVE_API_URL is correct."
                    .yellow()
            );
        }
        _ => {}
    }

    if let CliError::Api {
        request_id: Some(request_id),
        ..
    } = cli_err
    {
        eprintln!("\nRequest ID: {}", request_id);
    }
}
