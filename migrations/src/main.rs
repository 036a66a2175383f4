use sea_orm_migration::prelude::*;
use std::env;

use migration::Migrator;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("up");

    // An explicit URL argument wins over DATABASE_URL.
    let db_url = match args.get(2) {
        Some(url) => url.clone(),
        None => env::var("DATABASE_URL").unwrap_or_else(|_| {
            eprintln!("usage: migration <up|down|fresh|status> [DATABASE_URL]");
            std::process::exit(2);
        }),
    };

    let db = match sea_orm::Database::connect(&db_url).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("failed to connect to controller database: {}", e);
            std::process::exit(1);
        }
    };

    let result = match command {
        "up" => Migrator::up(&db, None).await.map(|_| "controller schema is up to date"),
        "down" => Migrator::down(&db, Some(1)).await.map(|_| "last migration rolled back"),
        "fresh" => Migrator::fresh(&db).await.map(|_| "controller schema recreated"),
        "status" => Migrator::status(&db).await.map(|_| "status printed"),
        _ => {
            eprintln!("Unknown command: {}. Use: up, down, fresh, or status", command);
            std::process::exit(1);
        }
    };

    match result {
        Ok(msg) => println!("{}", msg),
        Err(e) => {
            eprintln!("migration {} failed: {}", command, e);
            std::process::exit(1);
        }
    }
}
