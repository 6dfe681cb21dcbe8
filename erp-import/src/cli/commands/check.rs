//! `check` command

use anyhow::Result;
use colored::*;

use crate::api::{ErpClient, Session};
use crate::config::Config;

pub async fn handle_check_command(config: Config) -> Result<()> {
    let credentials = config.credentials()?;
    let resilience = config.to_resilience();
    let server = credentials.server_url.clone();
    let database = credentials.database.clone();
    let user = credentials.username.clone();

    let client = ErpClient::new(credentials, resilience.request_timeout)?;
    let mut session = Session::new(client, &resilience);

    let result = async {
        let version = session.version().await?;
        let uid = session.authenticate().await?;
        Ok::<_, anyhow::Error>((version, uid))
    }
    .await;
    session.close().await;
    let (version, uid) = result?;

    let server_version = version
        .as_struct()
        .and_then(|info| info.get("server_version"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    println!("{} {}", "Connected to".green(), server.cyan());
    println!("  server version  {}", server_version);
    println!("  database        {}", database);
    println!("  user            {} (id {})", user, uid);
    Ok(())
}
