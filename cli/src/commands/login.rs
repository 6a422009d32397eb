//! `hoist login` command: store registry credentials.

use std::io::BufRead;

use clap::Args;

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server (default: index.docker.io)
    pub server: Option<String>,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,

    /// Store an OAuth2 identity (refresh) token instead of a password
    #[arg(long, conflicts_with_all = ["username", "password", "password_stdin"])]
    pub identity_token: Option<String>,
}

pub async fn execute(args: LoginArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = args.server.unwrap_or_else(|| "index.docker.io".to_string());
    let store = hoist_image::CredentialStore::default_path()?;

    if let Some(token) = args.identity_token {
        if token.is_empty() {
            return Err("Identity token must not be empty".into());
        }
        store.store_identity_token(&server, &token)?;
        println!("Login Succeeded");
        return Ok(());
    }

    let username = match args.username {
        Some(u) => u,
        None => prompt("Username: ")?,
    };

    let password = if args.password_stdin {
        read_line()?
    } else {
        match args.password {
            Some(p) => p,
            None => prompt("Password: ")?,
        }
    };

    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    store.store(&server, &username, &password)?;

    println!("Login Succeeded");
    Ok(())
}

fn prompt(label: &str) -> std::io::Result<String> {
    eprint!("{}", label);
    read_line()
}

fn read_line() -> std::io::Result<String> {
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
