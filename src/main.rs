use std::{error::Error, fs, process::exit, time::Duration};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    cache::RedisSeenCache,
    config::{Backend, Config, RedisConfig},
    delivery::{HttpProbe, Messenger, Remuxer, StrategyResolver},
    routing::{Router, StaticSubscriptions},
    scraper::{Pacing, Scraper},
    sources::reddit::{normalize, RedditClient, RedditReply, SubredditListing},
    telegram::TelegramClient,
    transport::{telegram_channel, BroadcastTransport, DurableTransport, Transport},
};

mod cache;
mod config;
mod delivery;
mod model;
mod routing;
mod scraper;
mod sources;
mod telegram;
mod transport;

#[derive(Parser)]
#[clap(version, about)]
struct Args {
    /// Toml configuration.
    #[clap(short, long, value_parser, default_value = "redfoxbot.toml")]
    config: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll subscribed listings and publish new posts on the media channel.
    Scrape,
    /// Hand posts from the media channel to the bots of subscribed chats.
    Route,
    /// Send outbound messages of the configured bot to telegram.
    Deliver,
    /// Print normalized posts of a saved listing json. Needs no config.
    Normalize {
        #[clap(value_parser)]
        file: String,
        /// Listing the file was fetched from.
        #[clap(long, value_parser, default_value = "https://www.reddit.com/r/all/")]
        listing: String,
    },
}

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Normalize { file, listing } => print_normalized(&file, &listing),
        Command::Scrape => scrape(&args.config).await,
        Command::Route => route(&args.config).await,
        Command::Deliver => deliver(&args.config).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        exit(1);
    }
}

fn load_config(path: &str) -> Result<Config, BoxError> {
    info!("Reading config from {}", path);
    Ok(Config::load(path)?)
}

async fn scrape(config_path: &str) -> Result<(), BoxError> {
    let cfg = load_config(config_path)?;
    let transport = connect(&cfg.redis).await?;

    let mut reddit = RedditClient::new(&cfg.reddit.user_agent)?;
    if let Some(url) = &cfg.reddit.base_url {
        reddit = reddit.with_base_url(url);
    }
    let cache = RedisSeenCache::connect(&cfg.redis.url, cfg.reddit.cache_size).await?;
    let pacing = Pacing {
        pause: Duration::from_secs(cfg.reddit.pause_secs),
        step: Duration::from_secs(cfg.reddit.pause_step_secs),
        max: Duration::from_secs(cfg.reddit.max_pause_secs),
    };
    let subscriptions = StaticSubscriptions::new(bot_channel(&cfg), &cfg.subscriptions)?;

    Scraper::new(reddit, cache, subscriptions, pacing).run(transport.as_ref()).await?;
    Ok(())
}

async fn route(config_path: &str) -> Result<(), BoxError> {
    let cfg = load_config(config_path)?;
    let transport = connect(&cfg.redis).await?;
    let subscriptions = StaticSubscriptions::new(bot_channel(&cfg), &cfg.subscriptions)?;

    Router::new(subscriptions).serve(transport.as_ref()).await?;
    Err("media subscription ended".into())
}

async fn deliver(config_path: &str) -> Result<(), BoxError> {
    let cfg = load_config(config_path)?;
    let transport = connect(&cfg.redis).await?;

    let mut telegram = TelegramClient::new(&cfg.telegram.token)?
        .with_request_timeout(Duration::from_secs(cfg.telegram.request_timeout_secs));
    if let Some(url) = &cfg.telegram.api_url {
        telegram = telegram.with_base_url(url);
    }
    let channel = telegram_channel(telegram.bot_id());

    let mut remuxer = Remuxer::new(&cfg.merge.ffmpeg)
        .with_args(cfg.merge.args.clone())
        .with_timeout(Duration::from_secs(cfg.merge.timeout_secs));
    if let Some(dir) = &cfg.merge.work_dir {
        remuxer = remuxer.with_work_dir(dir);
    }
    let resolver = StrategyResolver::new(HttpProbe::new(reqwest::Client::new()), remuxer);

    Messenger::new(telegram, resolver).serve(transport.as_ref(), &channel).await?;
    Err(format!("{channel} subscription ended").into())
}

/// Channel of the configured bot. Subscriptions in the config all go through it.
fn bot_channel(cfg: &Config) -> String {
    telegram_channel(telegram::bot_id(&cfg.telegram.token))
}

async fn connect(cfg: &RedisConfig) -> Result<Box<dyn Transport>, BoxError> {
    let transport: Box<dyn Transport> = match cfg.backend {
        Backend::Broadcast => {
            Box::new(BroadcastTransport::connect(&cfg.url).await?.verify_accepted(cfg.verify_accepted))
        }
        Backend::Durable => Box::new(DurableTransport::connect(&cfg.url, &cfg.group, &cfg.consumer).await?),
    };
    Ok(transport)
}

fn print_normalized(file: &str, listing: &str) -> Result<(), BoxError> {
    let source_id = SubredditListing::from_url(listing)?.source_id();
    let reply: RedditReply = serde_json::from_slice(&fs::read(file)?)?;

    for post in reply.into_posts() {
        println!("{}", serde_json::to_string_pretty(&normalize(&source_id, &post))?);
    }
    Ok(())
}
