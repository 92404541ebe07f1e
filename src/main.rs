use anyhow::{Context, Result};
use frontdesk::{
    ApiClient, ApiResponse, AuthStore, ClientError, Config, RequestContext, Session,
    auth::token_expiry, logging,
};
use std::io::Write;

const USAGE: &str = "Usage: frontdesk <login <username>|logout|status|get <path>|delete <path>|post <path> <json>|patch <path> <json>>";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    let config = Config::load()?;
    logging::init(&config.logging);

    let store = AuthStore::from_config(&config.store).context("Failed to load stored credentials")?;
    let client = ApiClient::from_config(&config, store)?;
    let session = Session::new(client, &config.auth.login_path)?;

    let outcome = run(&session, &config, &args[1..]).await;

    if let Err(e) = &outcome {
        if e.downcast_ref::<ClientError>().is_some_and(ClientError::requires_login) {
            eprintln!("🔒 {}", e);
            eprintln!("   Run: frontdesk login <username>");
            std::process::exit(2);
        }
    }

    outcome
}

async fn run(session: &Session, config: &Config, args: &[String]) -> Result<()> {
    match (args[0].as_str(), &args[1..]) {
        ("login", [username]) => {
            let password = read_password()?;
            match session.login(username, &password).await {
                Ok(()) => {
                    println!("✅ Logged in as {}", username);
                    Ok(())
                }
                Err(ClientError::InvalidLogin) => {
                    eprintln!("❌ Invalid username or password");
                    std::process::exit(1);
                }
                Err(e) => Err(e.into()),
            }
        }

        ("logout", []) => {
            session.logout()?;
            println!("✅ Logged out, stored credentials removed");
            Ok(())
        }

        ("status", []) => {
            print_status(session, config);
            Ok(())
        }

        ("get", [path]) => request(session, RequestContext::get(path.as_str())).await,
        ("delete", [path]) => request(session, RequestContext::delete(path.as_str())).await,
        ("post", [path, body]) => {
            let body: serde_json::Value =
                serde_json::from_str(body).context("Request body is not valid JSON")?;
            request(session, RequestContext::post(path.as_str()).json(&body)?).await
        }
        ("patch", [path, body]) => {
            let body: serde_json::Value =
                serde_json::from_str(body).context("Request body is not valid JSON")?;
            request(session, RequestContext::patch(path.as_str()).json(&body)?).await
        }

        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }
}

async fn request(session: &Session, ctx: RequestContext) -> Result<()> {
    session.require_authenticated()?;
    let res = session.client().send(ctx).await?;
    print_response(&res);
    Ok(())
}

fn print_response(res: &ApiResponse) {
    if res.body.is_empty() {
        println!("{}", res.status());
        return;
    }

    match res.json::<serde_json::Value>() {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", res.text()),
        },
        Err(_) => println!("{}", res.text()),
    }
}

fn print_status(session: &Session, config: &Config) {
    let state = session.client().store().state();

    println!("\n🔐 Authentication Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
    println!("   API: {}", config.api.base_url);

    if !state.authenticated {
        println!("❌ Not authenticated");
        println!();
        return;
    }

    println!("✅ Authenticated");
    if let Some(updated_at) = state.updated_at {
        println!("   Tokens updated: {}", updated_at);
    }

    let expiry = state.credentials.access.as_deref().and_then(token_expiry);
    match expiry {
        Some(expires) if expires > chrono::Utc::now() => {
            let remaining = expires - chrono::Utc::now();
            println!(
                "   Access token expires: {} ({} minutes remaining)",
                expires,
                remaining.num_minutes()
            );
        }
        Some(_) => println!("   ⚠️  Access token expired (will renew on next request)"),
        None => println!("   Access token expiry: unknown"),
    }

    if state.credentials.refresh.is_none() {
        println!("   ⚠️  No refresh token stored, expired sessions cannot be renewed");
    }
    println!();
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var("FRONTDESK_PASSWORD") {
        return Ok(password);
    }

    print!("🔑 Password: ");
    std::io::stdout().flush()?;

    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}
