use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "mesh-cli")]
#[command(about = "Management CLI for the service mesh admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:15000")]
    url: String,

    #[arg(short, long, env = "MESH_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check node status
    Status,
    /// List services and instance counts
    Services,
    /// List the instances of one service
    Instances { service: String },
    /// Register an instance
    Register {
        service: String,
        host: String,
        port: u16,
        #[arg(long, default_value = "")]
        version: String,
        #[arg(long, default_value = "http")]
        protocol: String,
    },
    /// Remove an instance
    Deregister {
        service: String,
        host: String,
        port: u16,
    },
    /// Refresh an instance's heartbeat
    Heartbeat {
        service: String,
        host: String,
        port: u16,
    },
    /// Set an instance's health (healthy, unhealthy, unknown)
    Health {
        service: String,
        host: String,
        port: u16,
        state: String,
    },
    /// List traffic policies, or show one
    Policies { service: Option<String> },
    /// Create or replace a policy from a JSON file
    SetPolicy { service: String, file: std::path::PathBuf },
    /// Remove a policy
    RemovePolicy { service: String },
    /// Raise a canary's weight by one step
    Increment { service: String },
    /// Make the canary version the stable version
    Promote { service: String },
    /// Show circuit breaker states
    Breakers,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let base = cli.url.trim_end_matches('/');

    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Services => client.get(format!("{}/admin/services", base)),
        Commands::Instances { service } => {
            client.get(format!("{}/admin/services/{}/instances", base, service))
        }
        Commands::Register {
            service,
            host,
            port,
            version,
            protocol,
        } => client
            .post(format!("{}/admin/services/{}/instances", base, service))
            .json(&json!({
                "host": host,
                "port": port,
                "version": version,
                "protocol": protocol,
            })),
        Commands::Deregister {
            service,
            host,
            port,
        } => client.delete(format!(
            "{}/admin/services/{}/instances/{}/{}",
            base, service, host, port
        )),
        Commands::Heartbeat {
            service,
            host,
            port,
        } => client.post(format!(
            "{}/admin/services/{}/instances/{}/{}/heartbeat",
            base, service, host, port
        )),
        Commands::Health {
            service,
            host,
            port,
            state,
        } => client
            .put(format!(
                "{}/admin/services/{}/instances/{}/{}/health",
                base, service, host, port
            ))
            .json(&json!({ "health": state })),
        Commands::Policies { service: None } => client.get(format!("{}/admin/policies", base)),
        Commands::Policies {
            service: Some(service),
        } => client.get(format!("{}/admin/policies/{}", base, service)),
        Commands::SetPolicy { service, file } => {
            let policy: Value = serde_json::from_str(&std::fs::read_to_string(file)?)?;
            client
                .put(format!("{}/admin/policies/{}", base, service))
                .json(&policy)
        }
        Commands::RemovePolicy { service } => {
            client.delete(format!("{}/admin/policies/{}", base, service))
        }
        Commands::Increment { service } => {
            client.post(format!("{}/admin/policies/{}/canary/increment", base, service))
        }
        Commands::Promote { service } => {
            client.post(format!("{}/admin/policies/{}/canary/promote", base, service))
        }
        Commands::Breakers => client.get(format!("{}/admin/breakers", base)),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("OK ({})", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
