use std::{env, fs};

use anyhow::{bail, Context};
use restaurant_onboarding::{AppConfig, NewClient, OnboardingService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(path) = env::args().nth(1) else {
        bail!("usage: restaurant-onboarding <registration.json>");
    };
    let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let payload: NewClient =
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;

    let mut service = OnboardingService::initialize(AppConfig::from_env())?;
    let registration = service.register_client(payload)?;
    println!("{}", registration.message);

    service.shutdown().await;
    let locations = service.locations_for(registration.client.id)?;
    println!("{}", serde_json::to_string_pretty(&locations)?);
    Ok(())
}
