use chrono::{Duration, Utc};
use oscard_auth::{generate_verification_token, hash_password};
use oscard_storage::{connect, NewUser, Storage};
use std::env;
use tokio::runtime::Builder;
use tracing::info;

const VERIFICATION_TTL_HOURS: i64 = 24;

fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut runtime = Builder::new_multi_thread();
    runtime.enable_all();
    let runtime = runtime.build().expect("failed to build runtime");
    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), String> {
    let mut args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() {
        return Err("usage: oscard-cli <migrate|register-user|verify-email|diagnose>".to_string());
    }
    let command = args.remove(0);
    match command.as_str() {
        "migrate" => command_migrate().await,
        "register-user" => command_register_user(args).await,
        "verify-email" => command_verify_email(args).await,
        "diagnose" => command_diagnose().await,
        other => Err(format!("unknown command: {}", other)),
    }
}

async fn open_storage() -> Result<Storage, String> {
    let dsn =
        env::var("OSCARD_PG_DSN").map_err(|_| "OSCARD_PG_DSN is not configured".to_string())?;
    connect(&dsn)
        .await
        .map_err(|err| format!("storage connection failed: {}", err))
}

async fn command_migrate() -> Result<(), String> {
    let storage = open_storage().await?;
    storage
        .migrate()
        .await
        .map_err(|err| format!("migration failed: {}", err))?;
    info!("migrations applied");
    Ok(())
}

async fn command_register_user(args: Vec<String>) -> Result<(), String> {
    if args.len() != 3 {
        return Err("usage: oscard-cli register-user <screen-name> <email> <password>".to_string());
    }
    let storage = open_storage().await?;
    let password_hash =
        hash_password(&args[2]).map_err(|err| format!("could not hash password: {}", err))?;
    let user = storage
        .create_user(&NewUser {
            formatted_screen_name: args[0].clone(),
            email: args[1].clone(),
            password: args[2].clone(),
            password_hash,
        })
        .await
        .map_err(|err| format!("could not create user: {}", err))?;
    let token = generate_verification_token();
    let verification = storage
        .upsert_email_verification(
            &user.screen_name,
            &token,
            Utc::now() + Duration::hours(VERIFICATION_TTL_HOURS),
        )
        .await
        .map_err(|err| format!("could not provision verification: {}", err))?;
    info!(screen_name = %user.screen_name, "user registered");
    println!(
        "registered {} (verification token {} valid until {})",
        user.screen_name, verification.token, verification.expires_at
    );
    Ok(())
}

async fn command_verify_email(args: Vec<String>) -> Result<(), String> {
    if args.len() != 2 {
        return Err("usage: oscard-cli verify-email <screen-name> <token>".to_string());
    }
    let storage = open_storage().await?;
    storage
        .claim_email_verification(&args[0], &args[1])
        .await
        .map_err(|err| format!("verification rejected: {}", err))?;
    println!("verified {}", args[0]);
    Ok(())
}

async fn command_diagnose() -> Result<(), String> {
    let storage = open_storage().await?;
    storage
        .readiness()
        .await
        .map_err(|err| format!("storage not ready: {}", err))?;
    println!("storage ready");
    Ok(())
}
