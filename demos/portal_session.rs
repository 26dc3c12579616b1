//! Sign in and make an authenticated call
//!
//! Usage:
//!   PORTAL_BASE_URL=https://portal.example.com/api \
//!   PORTAL_EMAIL=parent@example.com PORTAL_PASSWORD=secret \
//!   cargo run --example portal_session

use portal_client::logging::init_tracing;
use portal_client::{AuthClient, ClientConfig, LoginRequest, SessionStore, SharedLocale};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let config = ClientConfig::from_env()?;
    let email = std::env::var("PORTAL_EMAIL").unwrap_or_else(|_| "parent@example.com".to_string());
    let password = std::env::var("PORTAL_PASSWORD").unwrap_or_default();
    let path = std::env::var("PORTAL_PATH").unwrap_or_else(|_| "/students".to_string());

    println!("=== Portal Client Example ===");
    println!("Backend: {}", config.base_url);
    println!();

    let locale = SharedLocale::new("uz");
    let client = AuthClient::new(config, SessionStore::in_memory())?.with_locale(Arc::new(locale));

    // Report forced sign-outs the way an app would redirect to its login screen
    let mut session_events = client.session().subscribe();
    tokio::spawn(async move {
        while session_events.changed().await.is_ok() {
            if session_events.borrow().is_none() {
                println!("! Session ended, sign in again");
            }
        }
    });

    let session = client.login(&LoginRequest { email, password }).await?;
    println!("✓ Signed in");
    if let Some(name) = session.user.as_ref().and_then(|u| u.full_name.as_deref()) {
        println!("  User: {name}");
    }
    println!();

    println!("GET {path} ...");
    match client.get(&path).await {
        Ok(response) => {
            println!("✓ {}", response.status);
            println!("{}", response.body);
        }
        Err(e) => println!("! Request failed: {e}"),
    }

    client.sign_out();
    Ok(())
}
