use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use client_core::{
    ControllerEvent, DurableRequestStore, HttpAuthSessionProvider, Severity, SubmissionController,
};
use shared::domain::RequestId;
use storage::{NewRequest, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/admin.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a new chatbot request.
    NewRequest {
        customer_name: String,
        email: String,
        website_url: String,
        description: String,
    },
    /// List stored requests, newest first.
    List,
    /// Run a pending request through the provisioning workflow.
    Submit {
        request_id: String,
        #[arg(long)]
        server_url: String,
        #[arg(long)]
        username: String,
        /// Workflow endpoint base; defaults to `<server_url>/`.
        #[arg(long)]
        endpoint_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::NewRequest {
            customer_name,
            email,
            website_url,
            description,
        } => {
            let record = storage
                .create_request(NewRequest {
                    customer_name,
                    email,
                    website_url,
                    description,
                })
                .await?;
            println!("created request id={}", record.id);
        }
        Command::List => {
            for record in storage.list_requests().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.id,
                    record.qchatform_status.as_str(),
                    record.customer_name,
                    record
                        .application_id_q
                        .map(|application_id| application_id.0)
                        .unwrap_or_default(),
                );
            }
        }
        Command::Submit {
            request_id,
            server_url,
            username,
            endpoint_url,
        } => {
            let request = storage
                .get_request(&RequestId(request_id.clone()))
                .await?
                .ok_or_else(|| anyhow!("no request with id {request_id}"))?;
            let endpoint_url = endpoint_url.unwrap_or_else(|| format!("{server_url}/"));

            let controller = SubmissionController::new_with_dependencies(
                endpoint_url,
                Arc::new(HttpAuthSessionProvider::new(server_url, username)),
                Arc::new(DurableRequestStore::new(storage)),
            );

            let mut events = controller.subscribe_events();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        ControllerEvent::ProgressChanged {
                            value,
                            message: Some(message),
                        } => println!("[{value:>3}%] {message}"),
                        ControllerEvent::Notification {
                            severity: Severity::Error,
                            text,
                        } => eprintln!("{text}"),
                        ControllerEvent::Notification { text, .. } => println!("{text}"),
                        _ => {}
                    }
                }
            });

            let outcome = controller.submit(&request).await;
            printer.abort();
            outcome?;
            println!("request {} completed", request.id);
        }
    }

    Ok(())
}
