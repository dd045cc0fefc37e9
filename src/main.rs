use anyhow::{Context, Result};
use dialoguer::Password;
use reqwest::Method;

use nursery_portal_client::config::{self, Command, Config};
use nursery_portal_client::transport::HttpResponse;
use nursery_portal_client::{ApiClient, ApiError, ApiRequest};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for response bodies
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        server = %config.server_url,
        credentials = %config.credentials_db.display(),
        "Configuration loaded"
    );

    let client = ApiClient::from_config(&config)?;

    if let Err(e) = run(&client, command).await {
        let unauthenticated = e
            .downcast_ref::<ApiError>()
            .is_some_and(ApiError::is_unauthenticated);
        if unauthenticated {
            tracing::error!("❌ {}", e);
            anyhow::bail!("Session expired, run `nursery-portal login` to sign in again");
        }
        return Err(e);
    }

    Ok(())
}

async fn run(client: &ApiClient, command: Command) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => Password::new()
                    .with_prompt(format!("Password for {}", username))
                    .interact()
                    .context("Failed to read password")?,
            };

            client.login(&username, &password).await?;
            println!("✅ Logged in as {}", username);
        }

        Command::Logout => {
            client.logout()?;
            println!("Logged out");
        }

        Command::Status { check } => {
            let state = if check {
                client.verify_session().await?
            } else {
                client.session_state().await?
            };
            println!("{}", state);
        }

        Command::Get { path, query } => {
            let mut request = ApiRequest::get(path);
            for pair in &query {
                let (key, value) = config::parse_query_pair(pair)?;
                request = request.query(key, value);
            }
            print_body(&client.request(request).await?);
        }

        Command::Post { path, data } => send(client, Method::POST, path, &data).await?,
        Command::Put { path, data } => send(client, Method::PUT, path, &data).await?,
        Command::Patch { path, data } => send(client, Method::PATCH, path, &data).await?,

        Command::Delete { path } => {
            print_body(&client.request(ApiRequest::delete(path)).await?);
        }
    }

    Ok(())
}

async fn send(client: &ApiClient, method: Method, path: String, data: &str) -> Result<()> {
    let body: serde_json::Value =
        serde_json::from_str(data).context("Request body must be valid JSON")?;
    let request = ApiRequest::new(method, path).json(&body)?;
    print_body(&client.request(request).await?);
    Ok(())
}

/// Pretty-print JSON bodies, pass anything else through
fn print_body(response: &HttpResponse) {
    if response.body.is_empty() {
        println!("{}", response.status());
        return;
    }

    match response.json::<serde_json::Value>() {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| response.text())
        ),
        Err(_) => println!("{}", response.text()),
    }
}
