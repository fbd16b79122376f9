use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use booru_mirror::repo::Repo;
use booru_mirror::sync::PostSync;
use booru_mirror::{DanbooruApi, FetchClient, MirrorConfig, SyncEngine};

const USAGE: &str = "usage: booru-mirror <tag NAME...|tag-id ID...|post ID...>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else { bail!(USAGE) };
    let keys: Vec<String> = args.collect();
    if keys.is_empty() {
        bail!(USAGE);
    }

    let cfg = MirrorConfig::from_env();
    info!("Remote: {} (proxy: {})", cfg.fetch.base_url, cfg.fetch.proxy_url.as_deref().unwrap_or("none"));

    let repo = build_repo(&cfg).await?;
    let client = FetchClient::new(&cfg.fetch).context("building http client")?;
    let homepage = client.base_url().to_string();
    let engine = SyncEngine::new(repo.clone(), Arc::new(DanbooruApi::new(client)), cfg.stale_threshold);

    let mut failures = 0;
    match command.as_str() {
        "tag" => {
            for name in &keys {
                match engine.tag_by_name(name).await {
                    Ok(tag) => println!("{}\t{}\t{}\t{}", tag.id, tag.name, tag.category, tag.post_count),
                    Err(e) => { error!("{e}"); failures += 1; }
                }
            }
        }
        "tag-id" => {
            for raw in &keys {
                let id = raw.parse().with_context(|| format!("invalid tag id '{raw}'"))?;
                match engine.tag_by_id(id).await {
                    Ok(tag) => println!("{}\t{}\t{}\t{}", tag.id, tag.name, tag.category, tag.post_count),
                    Err(e) => { error!("{e}"); failures += 1; }
                }
            }
        }
        "post" => {
            let board = repo.ensure_imageboard(&cfg.imageboard_name, &homepage).await?;
            for raw in &keys {
                let local_id = raw.parse().with_context(|| format!("invalid post id '{raw}'"))?;
                match engine.sync_post(&board, local_id).await {
                    Ok(PostSync::Missing(_)) => println!("{local_id}\tmissing"),
                    Ok(PostSync::Fresh { revision, .. }) => println!("{local_id}\tfresh\t{}", revision.recorded_at),
                    Ok(PostSync::Recorded { revision, changes, .. }) => {
                        println!("{local_id}\trecorded\t{}\t{}", revision.id, changes.changed_properties().join(","))
                    }
                    Err(e) => { error!("{e}"); failures += 1; }
                }
            }
        }
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }

    if failures > 0 {
        bail!("{failures} of {} lookups failed", keys.len());
    }
    Ok(())
}

async fn build_repo(cfg: &MirrorConfig) -> anyhow::Result<Arc<dyn Repo>> {
    match &cfg.database_url {
        Some(url) => connect_pg(url, cfg.database_max_connections).await,
        None => in_memory(),
    }
}

#[cfg(feature = "postgres-store")]
async fn connect_pg(url: &str, max_connections: u32) -> anyhow::Result<Arc<dyn Repo>> {
    let repo = booru_mirror::repo::pg::PgRepo::connect_lazy(url, max_connections)?;
    repo.migrate().await?;
    info!("Using Postgres repository backend");
    Ok(Arc::new(repo))
}

#[cfg(not(feature = "postgres-store"))]
async fn connect_pg(_url: &str, _max_connections: u32) -> anyhow::Result<Arc<dyn Repo>> {
    bail!("DATABASE_URL is set but this build has no postgres-store feature")
}

#[cfg(feature = "inmem-store")]
fn in_memory() -> anyhow::Result<Arc<dyn Repo>> {
    info!("DATABASE_URL not set; using in-memory repository backend");
    Ok(Arc::new(booru_mirror::repo::inmem::InMemRepo::new()))
}

#[cfg(not(feature = "inmem-store"))]
fn in_memory() -> anyhow::Result<Arc<dyn Repo>> {
    bail!("no repository backend available; set DATABASE_URL")
}
